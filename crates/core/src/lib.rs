pub mod admission;
pub mod breaker;
pub mod bus;
pub mod clock;
pub mod decision;
pub mod hls;
pub mod hwcaps;
pub mod metrics;
pub mod pipeline;
pub mod preflight;
pub mod receiver;
pub mod recordings;
pub mod sessions;
pub mod stream;
pub mod urlpolicy;
