//! Logging facade.
//! Forwards to `tracing` when the `tracing` feature is on. Otherwise the arguments are
//! type-checked and dropped.

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($t: tt)*) => {{
        let _ = format_args!($($t)*);
    }};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;

#[cfg(test)]
mod tests {
    use super::{debug, info, warn};

    #[test]
    fn test_macros_take_format_arguments() {
        let uid = [0x04u8, 0x11];
        let e = "timed out";

        debug!("TX: {:02x?}", uid);
        info!("Still waiting for a tag...");
        warn!("Connection to the reader failed: {}", e);
    }
}
