pub mod consul;
pub mod http_client;
pub mod http_handler;
pub mod token_client;

/// Re-export commonly used types from adapters
pub use consul::ConsulRegistry;
pub use http_client::HttpClientAdapter;
pub use http_handler::GatewayHandler;
pub use token_client::OAuthTokenChecker;
