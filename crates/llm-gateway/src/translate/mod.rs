//! Message translation: OpenAI wire shapes <-> upstream (Bedrock Converse) shapes.

pub mod request;
pub mod response;
pub mod stream;

pub use request::{RequestTranslator, TranslatorFeatures};
pub use response::ResponseTranslator;
pub use stream::StreamTranslator;
