//! Exchange and queue declarations.

use crate::broker::{BrokerChannel, BrokerHeaders, ExchangeKind, HeaderValue, QueueDeclaration};
use crate::config::TransportConfig;
use crate::error::BrokerResult;

/// Queue argument requesting mirroring across broker nodes.
pub const MIRRORING_ARGUMENT: &str = "x-ha-policy";

/// How queues and the exchange are declared. Every declaration is idempotent.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    exchange: String,
    declare_exchange: bool,
    bind_default_topic: bool,
    mirrored: bool,
}

impl Topology {
    pub(crate) fn from_config(config: &TransportConfig) -> Self {
        Self {
            exchange: config.exchange_name.clone(),
            declare_exchange: config.declare_exchange,
            bind_default_topic: config.bind_default_topic,
            mirrored: config.mirrored_queues,
        }
    }

    pub(crate) fn exchange(&self) -> &str {
        &self.exchange
    }

    pub(crate) fn queue_declaration(&self, name: &str, auto_delete: bool) -> QueueDeclaration {
        let mut arguments = BrokerHeaders::new();
        if self.mirrored {
            arguments.insert(
                MIRRORING_ARGUMENT.to_string(),
                HeaderValue::Text("all".to_string()),
            );
        }
        QueueDeclaration {
            name: name.to_string(),
            durable: true,
            auto_delete,
            arguments,
        }
    }

    /// Declare the topic exchange unless declaration is suppressed.
    pub(crate) async fn declare_exchange(&self, channel: &dyn BrokerChannel) -> BrokerResult<()> {
        if self.declare_exchange {
            channel
                .exchange_declare(&self.exchange, ExchangeKind::Topic)
                .await?;
        }
        Ok(())
    }

    /// Declare the exchange (unless suppressed), the queue, and its default binding.
    pub(crate) async fn declare_queue(
        &self,
        channel: &dyn BrokerChannel,
        name: &str,
        auto_delete: bool,
    ) -> BrokerResult<()> {
        self.declare_exchange(channel).await?;

        channel
            .queue_declare(&self.queue_declaration(name, auto_delete))
            .await?;

        if self.bind_default_topic {
            channel.queue_bind(name, &self.exchange, name).await?;
        }

        tracing::debug!(
            "declared queue {} (auto_delete={}) on exchange {}",
            name,
            auto_delete,
            self.exchange
        );
        Ok(())
    }
}
