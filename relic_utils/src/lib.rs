mod engine_args;
pub mod logging;

pub use engine_args::EngineArgs;

#[macro_export]
macro_rules! debug_panic {
    () => ( if cfg!(debug_assertions) { panic!(); } );
    ($($arg:tt)*) => ( if cfg!(debug_assertions) { panic!($($arg)*); } else { ::tracing::error!($($arg)*); } );
}
