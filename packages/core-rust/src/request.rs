//! Logical request and publication descriptors.

use crate::message::Payload;

/// Content type used when a request does not name one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// One logical call: created once, read-only thereafter.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    service: String,
    method: String,
    endpoint: String,
    content_type: String,
    body: Payload,
    stream: bool,
    raw_response: bool,
}

impl Request {
    /// Creates a request for `service`/`endpoint`. The method defaults to the
    /// endpoint name.
    #[must_use]
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>, body: Payload) -> Self {
        let endpoint = endpoint.into();
        Self {
            service: service.into(),
            method: endpoint.clone(),
            endpoint,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            body,
            stream: false,
            raw_response: false,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Marks the request as the opening message of a stream.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Asks for response bodies as undecoded bytes.
    #[must_use]
    pub fn with_raw_response(mut self) -> Self {
        self.raw_response = true;
        self
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn body(&self) -> &Payload {
        &self.body
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    #[must_use]
    pub fn wants_raw_response(&self) -> bool {
        self.raw_response
    }
}

/// A fire-and-forget message for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub content_type: String,
    pub payload: Payload,
}

impl Publication {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            payload,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}
