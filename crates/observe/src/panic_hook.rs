use std::panic::PanicInfo;

/// Installs a panic hook that reports panics through `tracing` so they end
/// up in the regular log pipeline instead of raw stderr.
pub fn install() {
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

fn tracing_panic_hook(panic: &PanicInfo) {
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::force_capture();
    tracing::error!("thread '{name}' {panic}\n{backtrace}");
}
