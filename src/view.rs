use crate::models::{Message, MessageId};

/// Rendering hints for one message, derived from its neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow<'a> {
    pub message: &'a Message,
    pub is_own: bool,
    /// First message of a run from the same sender.
    pub show_avatar: bool,
    /// Last message of a run from the same sender.
    pub show_timestamp: bool,
    pub is_pending: bool,
}

pub fn rows<'a>(messages: &'a [Message], local_user_id: &str) -> Vec<MessageRow<'a>> {
    messages
        .iter()
        .enumerate()
        .map(|(idx, message)| {
            let starts_run = idx == 0 || messages[idx - 1].sender_id != message.sender_id;
            let next_is_same = messages
                .get(idx + 1)
                .is_some_and(|next| next.sender_id == message.sender_id);

            MessageRow {
                message,
                is_own: message.sender_id == local_user_id,
                show_avatar: starts_run,
                show_timestamp: !next_is_same,
                is_pending: message.is_pending(),
            }
        })
        .collect()
}

/// Where to resume printing `messages` after `printed` went out.
///
/// `None` when an already printed row changed (a pending message confirmed in
/// place, a removal), so the whole list has to be printed again.
pub fn unprinted(printed: &[MessageId], messages: &[Message]) -> Option<usize> {
    let unchanged = printed.len() <= messages.len()
        && printed.iter().zip(messages).all(|(id, message)| *id == message.id);
    unchanged.then_some(printed.len())
}

/// `HH:MM` in UTC, as shown under the last message of a run.
pub fn time_label(message: &Message) -> String {
    message.created_at.format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LocalUser, Origin};
    use chrono::{TimeZone, Utc};

    fn message(id: &str, sender: &str) -> Message {
        Message {
            id: MessageId::new(id),
            text: format!("text {id}"),
            sender_id: sender.to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 2, 14, 9, 5, 0).unwrap(),
            sender: None,
            origin: Origin::Confirmed,
        }
    }

    #[test]
    fn runs_collapse_avatars_and_timestamps() {
        let list = vec![
            message("1", "riya"),
            message("2", "riya"),
            message("3", "me"),
            message("4", "riya"),
        ];
        let rows = rows(&list, "me");

        let avatars: Vec<bool> = rows.iter().map(|r| r.show_avatar).collect();
        let stamps: Vec<bool> = rows.iter().map(|r| r.show_timestamp).collect();
        assert_eq!(avatars, [true, false, true, true]);
        assert_eq!(stamps, [false, true, true, true]);
        assert!(rows[2].is_own);
        assert!(!rows[0].is_own);
    }

    #[test]
    fn pending_rows_are_flagged() {
        let user = LocalUser::new("me", "Me");
        let list = vec![Message::optimistic("on my way".to_string(), &user)];
        assert!(rows(&list, "me")[0].is_pending);
    }

    #[test]
    fn confirmed_pending_row_forces_reprint() {
        let user = LocalUser::new("me", "Me");
        let mut list = vec![message("1", "riya"), Message::optimistic("on my way".to_string(), &user)];
        let printed: Vec<MessageId> = list.iter().map(|m| m.id.clone()).collect();

        list.push(message("3", "riya"));
        assert_eq!(unprinted(&printed, &list), Some(2));

        list[1] = message("2", "me");
        assert_eq!(unprinted(&printed, &list), None);

        list.truncate(1);
        assert_eq!(unprinted(&printed, &list), None);
        assert_eq!(unprinted(&[], &list), Some(0));
    }

    #[test]
    fn time_label_is_hours_and_minutes() {
        assert_eq!(time_label(&message("1", "riya")), "09:05");
    }
}
