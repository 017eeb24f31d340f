pub use backoff::ExponentialBackoff;

mod backoff;
