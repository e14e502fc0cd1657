mod basic;
mod bypass;
mod client;
mod fetcher;
mod session;
pub mod auth;

pub use basic::BasicClient;
pub use bypass::{Bypass, ChallengeBypass, USER_AGENTS, looks_like_challenge};
pub use client::HttpClient;
pub use fetcher::{Endpoints, Fetcher, Resource, ResourceSource, RetryPolicy};
pub use session::{Cookie, Session, SessionStore};
