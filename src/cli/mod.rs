mod chat;
mod conversations;
mod render;
mod root;
mod run;

pub use root::Cli;
