pub mod cli;
pub mod request;

pub use cli::args::{Args, parse_args, print_help};
pub use request::build_chat_body;
