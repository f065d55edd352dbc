pub mod cli;
pub mod command;

pub use cli::DockerCli;
pub use command::containerized_command;
