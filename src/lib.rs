pub mod config;
pub mod expander;
pub mod geo;
pub mod probe;
pub mod report;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod sink;
pub mod validator;

/// Initializes the logging system for the application.
///
/// # Arguments
///
/// * `log_level`: The desired verbosity level for logging. Determines which log messages will be displayed.
///
/// # Returns
///
/// A result indicating the success or failure of the logging setup.
pub fn initialize_logging(log_level: log::LevelFilter) -> anyhow::Result<()> {
    stderrlog::new()
        .module(module_path!())
        .show_module_names(true)
        .verbosity(log_level)
        .init()?;
    Ok(())
}
