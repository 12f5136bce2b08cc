pub mod converter;
pub mod echo;
pub mod mock;
pub mod provider;
pub mod reliable;

pub use echo::EchoProvider;
pub use mock::{MockProvider, MockResponse};
pub use provider::{OpenAiConfig, OpenAiProvider};
pub use reliable::{ReliableConfig, ReliableProvider};
