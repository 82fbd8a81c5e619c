pub mod command;
pub mod output;

pub use command::CommandProvider;
pub use output::OutputCollector;
