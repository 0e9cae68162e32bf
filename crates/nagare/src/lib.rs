pub mod argument;
pub mod buffer;
pub mod error;
pub mod hls;
pub mod http;
pub mod options;
pub mod plugin;
pub mod session;
pub mod stream;
pub mod util;
pub mod validate;

pub use argument::{Argument, ArgumentAction, ArgumentError, Arguments, Nargs};
pub use error::{NagareError, NagareResult};
pub use options::{OptionValue, Options};
pub use session::Session;
pub use stream::{Stream, StreamMetadata, StreamReader};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
