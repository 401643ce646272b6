//! Remote execution over the envelope protocol
//!
//! A [`UnitServer`] exposes one workspace on a TCP endpoint; a
//! [`UnitClient`] drives it; a [`Distributor`] fronts a pool of units and
//! forwards work to the most capable one. Every exchange is a single
//! request envelope answered by a single response envelope, except `stop`,
//! which is fire-and-forget.
//!
//! Request metas carry a `command` field: `run`, `structure`,
//! `powerfullity`, or `stop`. Response metas carry a `status` field;
//! failures use `{"status": "failed", "error": ...}`.

mod client;
mod distributor;
mod unit;

pub use client::UnitClient;
pub use distributor::Distributor;
pub use unit::UnitServer;

use serde_json::Value;

use crate::meta::Meta;

/// Build a response meta from an object literal.
pub(crate) fn reply(value: Value) -> Meta {
    Meta::from_value(value).expect("response meta is an object")
}

pub(crate) fn failure(error: &str) -> Meta {
    reply(serde_json::json!({"status": "failed", "error": error}))
}
