// Message module: application messages and their wire pipeline

pub mod compress;
pub mod pipeline;
pub mod types;

pub use pipeline::{decode_body, encode_body, fragment, FrameKind, Fragment, PipelineError};
pub use types::{Content, Message, MessageBuilder};
