use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::{MessagePayload, Receipt},
};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryState {
    Sending,
    Sent,
    Delivered,
    Read,
}

/// Status shown next to an outgoing message. A read receipt implies delivery
/// even when no delivered receipt was recorded.
pub fn delivery_state(message: &MessagePayload) -> DeliveryState {
    if !message.status.read_by.is_empty() {
        DeliveryState::Read
    } else if !message.status.delivered_to.is_empty() {
        DeliveryState::Delivered
    } else if message.id.is_some() {
        DeliveryState::Sent
    } else {
        DeliveryState::Sending
    }
}

/// Orders server ids when list position is unknown: shorter ids first, then
/// lexicographic.
pub fn compare_message_ids(a: &MessageId, b: &MessageId) -> Ordering {
    a.as_str()
        .len()
        .cmp(&b.as_str().len())
        .then_with(|| a.as_str().cmp(b.as_str()))
}

/// Merges delivered/read receipts into the current user's own messages.
/// Receipt lists only ever grow.
#[derive(Debug, Clone)]
pub struct DeliveryReceiptReconciler {
    current_user: UserId,
}

impl DeliveryReceiptReconciler {
    pub fn new(current_user: UserId) -> Self {
        Self { current_user }
    }

    pub fn apply_delivered<'a>(
        &self,
        messages: impl IntoIterator<Item = &'a mut MessagePayload>,
        message_id: &MessageId,
        recipient: &UserId,
        at: DateTime<Utc>,
    ) -> bool {
        if *recipient == self.current_user {
            return false;
        }
        let Some(message) = messages
            .into_iter()
            .find(|message| message.id.as_ref() == Some(message_id))
        else {
            return false;
        };
        if message.sender_id != self.current_user {
            return false;
        }
        push_unique(&mut message.status.delivered_to, recipient, at)
    }

    /// Marks every own message up to and including `up_to` as read by
    /// `reader`. Returns how many messages gained a receipt.
    pub fn apply_read<'a>(
        &self,
        messages: impl IntoIterator<Item = &'a mut MessagePayload>,
        reader: &UserId,
        up_to: &MessageId,
        at: DateTime<Utc>,
    ) -> usize {
        if *reader == self.current_user {
            return 0;
        }

        let mut messages: Vec<&'a mut MessagePayload> = messages.into_iter().collect();
        let cutoff = messages
            .iter()
            .position(|message| message.id.as_ref() == Some(up_to));

        let mut changed = 0;
        for (index, message) in messages.iter_mut().enumerate() {
            if message.sender_id != self.current_user {
                continue;
            }
            let Some(id) = &message.id else {
                continue;
            };
            let covered = match cutoff {
                Some(cutoff) => index <= cutoff,
                None => compare_message_ids(id, up_to) != Ordering::Greater,
            };
            if covered && push_unique(&mut message.status.read_by, reader, at) {
                changed += 1;
            }
        }
        trace!(reader = %reader, up_to = %up_to, changed, "receipts: read receipt applied");
        changed
    }
}

fn push_unique(receipts: &mut Vec<Receipt>, user_id: &UserId, at: DateTime<Utc>) -> bool {
    if receipts.iter().any(|receipt| receipt.user_id == *user_id) {
        return false;
    }
    receipts.push(Receipt {
        user_id: user_id.clone(),
        at,
    });
    true
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
