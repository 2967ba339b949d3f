pub mod openai;
pub mod reliable;

pub mod mock;

pub use mock::{MockProvider, MockResponse};
pub use openai::{ChatCompletionsConfig, ChatCompletionsProvider};
pub use reliable::{ReliableConfig, ReliableProvider};
