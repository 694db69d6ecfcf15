//! Fire-and-forget publishing through the broker.

use stack_core::error::component;
use stack_core::message::header;
use stack_core::{CallError, Message, MessageType, Payload, Publication};
use tracing::debug;
use uuid::Uuid;

use super::Client;
use crate::broker::BrokerMessage;
use crate::context::CallContext;

impl Client {
    /// Publishes `publication` to its topic. The broker is connected on
    /// first use.
    ///
    /// # Errors
    ///
    /// `Timeout`/`Cancelled` if the context is already done, `Protocol` if
    /// the payload cannot be encoded, `Connection` for broker failures.
    pub async fn publish(
        &self,
        ctx: &CallContext,
        publication: &Publication,
    ) -> Result<(), CallError> {
        let Some(broker) = self.broker.as_ref() else {
            return Err(CallError::connection(component::BROKER, "no broker configured"));
        };
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let topic = self
            .state
            .load()
            .config
            .proxy
            .as_ref()
            .and_then(|p| p.service.clone())
            .unwrap_or_else(|| publication.topic.clone());
        let id = Uuid::new_v4().to_string();
        let mut message = Message::new(MessageType::Event);
        message.id.clone_from(&id);
        message.target.clone_from(&topic);
        message.header.clone_from(ctx.metadata());
        message
            .header
            .insert(header::CONTENT_TYPE.to_string(), publication.content_type.clone());
        message
            .header
            .insert(header::TOPIC.to_string(), publication.topic.clone());
        message.header.insert(header::ID.to_string(), id);

        let body = match &publication.payload {
            Payload::Raw(bytes) => bytes.clone(),
            Payload::Value(value) => {
                let codec = self.codecs.get(&publication.content_type).ok_or_else(|| {
                    CallError::protocol(
                        component::CODEC,
                        format!("unsupported content type: {}", publication.content_type),
                    )
                })?;
                codec
                    .encode(&message, value)
                    .map_err(|e| CallError::protocol(component::CODEC, e))?
            }
        };

        self.broker_connected
            .get_or_try_init(|| async {
                debug!(broker = broker.name(), "connecting broker");
                broker.connect().await
            })
            .await
            .map_err(|e| CallError::connection(component::BROKER, e))?;

        broker
            .publish(
                &topic,
                BrokerMessage {
                    header: message.header,
                    body,
                },
            )
            .await
            .map_err(|e| CallError::connection(component::BROKER, e))
    }
}
