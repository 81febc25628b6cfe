pub mod ring_buffer;
pub mod retry;

pub use retry::{is_http_retryable, retry_with_backoff, RetryConfig};
pub use ring_buffer::RingBuffer;
