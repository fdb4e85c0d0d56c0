pub mod entitlement;
pub mod feed;
pub mod gateway;
pub mod settings;
pub mod telegram;
pub mod tracker;
pub mod webhook;
