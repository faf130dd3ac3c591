//! minka — conversational marketplace bot.
//!
//! Matches service-seeking customers to verified providers over a
//! WhatsApp-style transport: free text is classified into a canonical
//! profession, the request is confirmed, a city is collected, the
//! provider catalog is searched and candidates are probed in real time
//! for availability. The first acceptors' contacts are handed back to
//! the customer.

#![allow(missing_docs)] // TODO: enforce once core types are stable

pub mod availability;
pub mod catalog;
pub mod config;
pub mod connect;
pub mod consent;
pub mod customers;
pub mod db;
pub mod flow;
pub mod interpret;
pub mod kv;
pub mod llm;
pub mod logging;
pub mod media;
pub mod messages;
pub mod resilience;
pub mod router;
pub mod safety;
pub mod search;
pub mod sessions;
pub mod text;
pub mod transport;
