//! LISTEN/NOTIFY coordination channel.
//!
//! The bus is the only cross-process eventing this subsystem assumes. It is
//! deliberately thin: send is one `pg_notify` call, receive is a
//! [`sqlx::postgres::PgListener`] loop with decode + de-duplication in front
//! of it. Delivery is at-least-once and unordered; everything that needs
//! ordering carries the phase version and is fenced by the receiver.

use crate::message::{DedupeRing, Message};
use crate::{SwitchoverResult, CHANNEL};
use sqlx::postgres::PgListener;
use sqlx::PgPool;

/// Outbound half. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    pool: PgPool,
    channel: String,
}

impl Bus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channel: CHANNEL.to_string(),
        }
    }

    /// Publish one message to every listener, this process included.
    pub async fn send(&self, msg: &Message) -> SwitchoverResult<()> {
        let payload = msg.encode()?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        metrics::counter!("beacon_switchover_bus_sent_total").increment(1);
        Ok(())
    }

    /// Subscribe. The returned stream owns a dedicated connection.
    pub async fn subscribe(&self) -> SwitchoverResult<BusStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        Ok(BusStream {
            listener,
            dedupe: DedupeRing::new(1024),
        })
    }
}

/// Inbound half: decoded, de-duplicated messages.
pub struct BusStream {
    listener: PgListener,
    dedupe: DedupeRing,
}

impl BusStream {
    /// Wait for the next fresh, well-formed message.
    ///
    /// Garbage payloads, unknown message kinds, and redelivered `msg_id`s
    /// are skipped silently; the channel is shared and at-least-once.
    pub async fn recv(&mut self) -> SwitchoverResult<Message> {
        loop {
            let notification = self.listener.recv().await?;
            let Some(msg) = Message::decode(notification.payload()) else {
                tracing::debug!("ignoring unintelligible bus payload");
                continue;
            };
            if !self.dedupe.observe(msg.msg_id) {
                continue;
            }
            metrics::counter!("beacon_switchover_bus_received_total").increment(1);
            return Ok(msg);
        }
    }
}
