//! Resilience patterns for long-running backend workers
//!
//! - **Backoff policies**: fixed and exponential (with jitter) delays, as objects
//!   callers can swap and test in isolation
//! - **Retry**: drive an async operation with a policy, optionally abandoning the
//!   waits when shutdown is requested
//! - **Timeout**: bound a single operation without losing its error type
//!
//! # Example: reconnect until shutdown
//!
//! ```rust,no_run
//! use resilience::{with_retry_until_shutdown, FixedBackoff};
//! use std::time::Duration;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
//!     let policy = FixedBackoff::new(Duration::from_secs(5));
//!
//!     let result = with_retry_until_shutdown(&policy, &mut shutdown_rx, |_attempt| async {
//!         // connect to something here
//!         Ok::<_, String>(())
//!     })
//!     .await;
//! }
//! ```

pub mod backoff;
pub mod retry;
pub mod timeout;

pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use retry::{sleep_unless_shutdown, with_retry_until_shutdown, RetryError};
pub use timeout::{with_timeout, TimeoutError};
