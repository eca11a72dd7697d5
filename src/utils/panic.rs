/// Install the panic hook. Debug builds print the full colored backtrace,
/// release builds keep it short unless `RUST_BACKTRACE` asks for more.
pub fn setup() {
    let verbosity = if cfg!(debug_assertions) {
        color_backtrace::Verbosity::Full
    } else {
        color_backtrace::Verbosity::from_env()
    };

    color_backtrace::BacktracePrinter::new()
        .verbosity(verbosity)
        .lib_verbosity(color_backtrace::Verbosity::Minimal)
        .install(color_backtrace::default_output_stream());
}
