mod command;
mod config;
mod environment;
mod executor;
mod prerequisites;
mod process;
#[cfg(test)]
mod testing;

pub use config::DockerConfig;
pub use environment::DockerEnvironment;
pub use executor::DockerExecutor;
