//! C6: Batch Scheduler.
//!
//! A batch is keyed by `(user_id, channel)` with `sent = false`; a new
//! message for the same pair joins the existing batch rather than opening a
//! new one, and the first message in a batch sets its scheduled send time
//! from the matched rule's frequency.

use aegis_common::model::{ChannelKind, Frequency, NotificationMessage, PendingBatch};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::template::RenderedContent;

pub struct BatchScheduler {
    batches: RwLock<Vec<PendingBatch>>,
}

impl BatchScheduler {
    pub fn new() -> Self {
        Self {
            batches: RwLock::new(Vec::new()),
        }
    }

    pub fn frequency_delay(frequency: Frequency) -> Duration {
        match frequency {
            Frequency::Immediate => Duration::zero(),
            Frequency::EveryFiveMinutes => Duration::minutes(5),
            Frequency::EveryFifteenMinutes => Duration::minutes(15),
            Frequency::Hourly => Duration::hours(1),
            Frequency::DailyDigest => Duration::hours(24),
            // The rule evaluator never emits a `Batch` decision for a
            // `Disabled` rule (it drops before reaching here); treated as
            // immediate as a defensive fallback.
            Frequency::Disabled => Duration::zero(),
        }
    }

    /// Adds `message` to the open batch for `(user_id, channel)`, creating
    /// one if none is open, and returns that batch's id.
    pub fn add_to_batch(
        &self,
        user_id: &str,
        channel: ChannelKind,
        message: NotificationMessage,
        frequency: Frequency,
        now: DateTime<Utc>,
    ) -> Uuid {
        let mut batches = self.batches.write();

        if let Some(batch) = batches
            .iter_mut()
            .find(|b| !b.sent && b.user_id == user_id && b.channel == channel)
        {
            batch.messages.push(message);
            return batch.id;
        }

        let batch = PendingBatch {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            channel,
            messages: vec![message],
            scheduled_send_time: now + Self::frequency_delay(frequency),
            sent: false,
        };
        let id = batch.id;
        batches.push(batch);
        id
    }

    /// Marks every batch due at or before `now` as sent and returns them.
    /// Sent batches are retained only long enough to be drained by the
    /// caller, then removed on the next call.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<PendingBatch> {
        let mut batches = self.batches.write();
        batches.retain(|b| !b.sent);

        let mut due = Vec::new();
        for batch in batches.iter_mut() {
            if batch.scheduled_send_time <= now {
                batch.sent = true;
                due.push(batch.clone());
            }
        }
        due
    }

    pub fn pending_count(&self) -> usize {
        self.batches.read().iter().filter(|b| !b.sent).count()
    }

    /// Unconditional flush, regardless of `scheduled_send_time` -- used at
    /// shutdown so no batch is silently lost mid-accumulation.
    pub fn drain_all(&self) -> Vec<PendingBatch> {
        let mut batches = self.batches.write();
        let unsent: Vec<PendingBatch> = batches.iter().filter(|b| !b.sent).cloned().collect();
        for batch in batches.iter_mut() {
            batch.sent = true;
        }
        batches.clear();
        unsent
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Composes an email digest for a batch: a subject naming the count and a
/// bulleted body enumerating each message's title and body.
pub fn compose_email_digest(batch: &PendingBatch) -> RenderedContent {
    let subject = format!("Notification Digest - {} updates", batch.messages.len());
    let mut body = String::new();
    for message in &batch.messages {
        body.push_str(&format!("- {}: {}\n", message.title, message.body));
    }
    RenderedContent { subject, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::model::Level;

    fn message(title: &str) -> NotificationMessage {
        NotificationMessage::new("orders", Level::Warning, title, "body")
    }

    #[test]
    fn messages_for_same_user_and_channel_join_one_batch() {
        let scheduler = BatchScheduler::new();
        let now = Utc::now();

        let id1 = scheduler.add_to_batch(
            "u1",
            ChannelKind::Email,
            message("first"),
            Frequency::Hourly,
            now,
        );
        let id2 = scheduler.add_to_batch(
            "u1",
            ChannelKind::Email,
            message("second"),
            Frequency::Hourly,
            now,
        );

        assert_eq!(id1, id2);
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[test]
    fn drain_due_only_returns_batches_past_their_scheduled_time() {
        let scheduler = BatchScheduler::new();
        let now = Utc::now();

        scheduler.add_to_batch(
            "u1",
            ChannelKind::Email,
            message("first"),
            Frequency::EveryFiveMinutes,
            now,
        );

        assert!(scheduler.drain_due(now).is_empty());

        let later = now + Duration::minutes(6);
        let due = scheduler.drain_due(later);
        assert_eq!(due.len(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn drain_all_flushes_regardless_of_scheduled_time() {
        let scheduler = BatchScheduler::new();
        let now = Utc::now();

        scheduler.add_to_batch("u1", ChannelKind::Email, message("first"), Frequency::DailyDigest, now);
        assert!(scheduler.drain_due(now).is_empty());

        let drained = scheduler.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn email_digest_enumerates_every_message() {
        let batch = PendingBatch {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            channel: ChannelKind::Email,
            messages: vec![message("first"), message("second")],
            scheduled_send_time: Utc::now(),
            sent: false,
        };

        let rendered = compose_email_digest(&batch);
        assert_eq!(rendered.subject, "Notification Digest - 2 updates");
        assert!(rendered.body.contains("first: body"));
        assert!(rendered.body.contains("second: body"));
    }
}
