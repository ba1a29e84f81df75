pub mod cache;
pub mod client;
pub mod protocol;
pub mod request;
pub mod response;

pub use cache::TranslationCache;
pub use client::{TranslateClient, TranslateStock};
pub use protocol::Command;
pub use request::TranslateRequest;
pub use response::{
    ForwardMode, HeaderForwardSettings, HeaderGroup, Transformation, TranslateResponse, View,
};
