pub mod cdc;
pub mod consumer;
pub mod ledger;
