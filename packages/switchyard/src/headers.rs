//! Message headers: the typed attribute set every message travels with.
//!
//! Every well-known field has a `set_*` method that only writes when the field
//! is absent (and reports whether it wrote) plus a `force_*` method that always
//! writes. Enrichers use `set_*`, which is what makes enrichment idempotent.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::ReplyAddress;
use crate::error::AddressError;
use crate::transport::header;

/// Correlation ID that ties a request, its reply, and every message it caused.
///
/// Kept as an opaque string so ids minted by other services survive the
/// round trip unchanged. [`CorrelationId::new`] mints a UUID v4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<Uuid> for CorrelationId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Unique id of a single message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

macro_rules! header_field {
    ($field:ident: $ty:ty, $get:ident -> $out:ty, $view:ident, $set:ident, $force:ident, $doc:literal) => {
        #[doc = concat!("The ", $doc, ", if set.")]
        pub fn $get(&self) -> Option<$out> {
            self.$field.$view()
        }

        #[doc = concat!("Set the ", $doc, " unless already present. Returns whether it wrote.")]
        pub fn $set(&mut self, value: impl Into<$ty>) -> bool {
            if self.$field.is_some() {
                return false;
            }
            self.$field = Some(value.into());
            true
        }

        #[doc = concat!("Overwrite the ", $doc, ".")]
        pub fn $force(&mut self, value: impl Into<$ty>) {
            self.$field = Some(value.into());
        }
    };
}

/// Typed headers plus an open extension map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    correlation_id: Option<CorrelationId>,
    message_id: Option<MessageId>,
    content_type: Option<String>,
    reply_to: Option<ReplyAddress>,
    route_key: Option<String>,
    namespace: Option<String>,
    source: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    received_at: Option<DateTime<Utc>>,
    error: bool,
    extensions: BTreeMap<String, String>,
}

impl Headers {
    /// Empty headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers carrying only a correlation id.
    pub fn correlated(id: impl Into<CorrelationId>) -> Self {
        Self {
            correlation_id: Some(id.into()),
            ..Self::default()
        }
    }

    header_field!(correlation_id: CorrelationId, correlation_id -> &CorrelationId, as_ref, set_correlation_id, force_correlation_id, "correlation id");
    header_field!(message_id: MessageId, message_id -> &MessageId, as_ref, set_message_id, force_message_id, "message id");
    header_field!(content_type: String, content_type -> &str, as_deref, set_content_type, force_content_type, "content type");
    header_field!(reply_to: ReplyAddress, reply_to -> &ReplyAddress, as_ref, set_reply_to, force_reply_to, "reply-to address");
    header_field!(route_key: String, route_key -> &str, as_deref, set_route_key, force_route_key, "broker route key");
    header_field!(namespace: String, namespace -> &str, as_deref, set_namespace, force_namespace, "message namespace");
    header_field!(source: String, source -> &str, as_deref, set_source, force_source, "source service");

    /// When the message was created, if set.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.occurred_at
    }

    /// Set `occurred_at` unless already present. Returns whether it wrote.
    pub fn set_occurred_at(&mut self, at: DateTime<Utc>) -> bool {
        if self.occurred_at.is_some() {
            return false;
        }
        self.occurred_at = Some(at);
        true
    }

    /// Overwrite `occurred_at`.
    pub fn force_occurred_at(&mut self, at: DateTime<Utc>) {
        self.occurred_at = Some(at);
    }

    /// When this process received the message, if it came from a broker.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    /// Set `received_at` unless already present. Returns whether it wrote.
    pub fn set_received_at(&mut self, at: DateTime<Utc>) -> bool {
        if self.received_at.is_some() {
            return false;
        }
        self.received_at = Some(at);
        true
    }

    /// Overwrite `received_at`.
    pub fn force_received_at(&mut self, at: DateTime<Utc>) {
        self.received_at = Some(at);
    }

    /// Whether the reserved error flag is set.
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Set the reserved error flag.
    pub fn mark_error(&mut self) {
        self.error = true;
    }

    /// Extension value by name.
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    /// Set an extension unless already present. Returns whether it wrote.
    pub fn set_extension(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        if self.extensions.contains_key(&name) {
            return false;
        }
        self.extensions.insert(name, value.into());
        true
    }

    /// Overwrite an extension.
    pub fn force_extension(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extensions.insert(name.into(), value.into());
    }

    /// Builder form of [`Headers::force_extension`].
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.force_extension(name, value);
        self
    }

    /// All extensions, sorted by name.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extensions
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Headers for a message caused by this one: same correlation id,
    /// everything else left for the enrichers.
    pub fn follow_up(&self) -> Headers {
        Headers {
            correlation_id: self.correlation_id.clone(),
            ..Headers::default()
        }
    }

    /// Flatten into transport header pairs.
    ///
    /// `received_at` is local and never sent.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut push = |name: &str, value: String| pairs.push((name.to_owned(), value));

        if let Some(v) = &self.content_type {
            push(header::CONTENT_TYPE, v.clone());
        }
        if let Some(v) = &self.message_id {
            push(header::MESSAGE_ID, v.to_string());
        }
        if let Some(v) = &self.correlation_id {
            push(header::CORRELATION_ID, v.to_string());
        }
        if let Some(v) = &self.reply_to {
            push(header::REPLY_TO, v.to_string());
        }
        if let Some(v) = &self.route_key {
            push(header::ROUTE_KEY, v.clone());
        }
        if let Some(v) = &self.namespace {
            push(header::NAMESPACE, v.clone());
        }
        if let Some(v) = &self.source {
            push(header::SOURCE, v.clone());
        }
        if let Some(v) = &self.occurred_at {
            push(header::OCCURRED_AT, v.to_rfc3339());
        }
        if self.error {
            push(header::ERROR, "true".to_owned());
        }
        for (name, value) in &self.extensions {
            push(&format!("{}{}", header::EXTENSION_PREFIX, name), value.clone());
        }
        pairs
    }

    /// Rebuild headers from transport pairs.
    ///
    /// Unknown names are ignored. An unparseable timestamp is dropped; a
    /// malformed reply-to address is an error.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, AddressError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut headers = Headers::default();
        for (name, value) in pairs {
            let name = name.as_ref();
            let value: String = value.into();
            match name {
                header::CONTENT_TYPE => headers.content_type = Some(value),
                header::MESSAGE_ID => headers.message_id = Some(MessageId(value)),
                header::CORRELATION_ID => headers.correlation_id = Some(CorrelationId(value)),
                header::REPLY_TO => headers.reply_to = Some(value.parse()?),
                header::ROUTE_KEY => headers.route_key = Some(value),
                header::NAMESPACE => headers.namespace = Some(value),
                header::SOURCE => headers.source = Some(value),
                header::OCCURRED_AT => {
                    headers.occurred_at = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
                header::ERROR => headers.error = value.eq_ignore_ascii_case("true"),
                other => {
                    if let Some(ext) = other.strip_prefix(header::EXTENSION_PREFIX) {
                        headers.extensions.insert(ext.to_owned(), value);
                    }
                }
            }
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_only_writes_when_absent() {
        let mut h = Headers::new();
        assert!(h.set_correlation_id("first"));
        assert!(!h.set_correlation_id("second"));
        assert_eq!(h.correlation_id().map(|c| c.as_str()), Some("first"));

        h.force_correlation_id("third");
        assert_eq!(h.correlation_id().map(|c| c.as_str()), Some("third"));
    }

    #[test]
    fn test_string_fields_borrow_as_str() {
        let mut h = Headers::new();
        h.set_content_type("application/json");
        h.set_namespace("calc.range");
        assert_eq!(h.content_type(), Some("application/json"));
        assert_eq!(h.namespace(), Some("calc.range"));
        assert_eq!(h.route_key(), None);
    }

    #[test]
    fn test_extensions_set_once() {
        let mut h = Headers::new().with_extension("tenant", "acme");
        assert!(!h.set_extension("tenant", "other"));
        assert!(h.set_extension("locale", "en"));
        assert_eq!(h.extension("tenant"), Some("acme"));
        let names: Vec<&str> = h.extensions().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["locale", "tenant"]);
    }

    #[test]
    fn test_follow_up_keeps_only_correlation() {
        let mut h = Headers::correlated("abc");
        h.set_message_id("m-1");
        h.set_source("calc");
        h.mark_error();

        let next = h.follow_up();
        assert_eq!(next.correlation_id().map(|c| c.as_str()), Some("abc"));
        assert!(next.message_id().is_none());
        assert!(next.source().is_none());
        assert!(!next.is_error());
    }

    #[test]
    fn test_pairs_round_trip() {
        let mut h = Headers::new();
        h.set_correlation_id("corr-1");
        h.set_message_id("msg-1");
        h.set_content_type("application/json");
        h.set_reply_to(ReplyAddress::new("main", "calc-reply-1"));
        h.set_route_key("calc.range");
        h.set_namespace("calc");
        h.set_source("calc-service");
        h.set_occurred_at(
            DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        h.mark_error();
        h.force_extension("tenant", "acme");

        let pairs = h.to_pairs();
        assert!(pairs
            .iter()
            .any(|(k, v)| k == "x-ext-tenant" && v == "acme"));
        assert!(pairs.iter().any(|(k, v)| k == "reply-to" && v == "main:calc-reply-1"));

        let back = Headers::from_pairs(pairs).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_received_at_is_not_sent() {
        let mut h = Headers::new();
        h.set_received_at(Utc::now());
        assert!(h.to_pairs().is_empty());
    }

    #[test]
    fn test_from_pairs_rejects_malformed_reply_to() {
        let err = Headers::from_pairs([("reply-to", "no-colon")]).unwrap_err();
        assert_eq!(err.input, "no-colon");
    }

    #[test]
    fn test_from_pairs_ignores_unknown_names() {
        let h = Headers::from_pairs([("x-unknown", "1"), ("message-id", "m")]).unwrap();
        assert_eq!(h.message_id().map(|m| m.as_str()), Some("m"));
        assert_eq!(h.extensions().count(), 0);
    }
}
