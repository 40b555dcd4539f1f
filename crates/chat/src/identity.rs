//! Canonical conversation ids for an unordered pair of users.

use duet_storage::{ConversationId, UserId};

use crate::error::{ChatResult, InvalidIdentitySnafu};

/// Joins the two sorted participant ids. User ids may not contain it.
pub const PAIR_SEPARATOR: char = '_';

/// Derives the conversation id shared by `first` and `second`.
///
/// `resolve(a, b) == resolve(b, a)` for every valid pair. Ids containing
/// [`PAIR_SEPARATOR`] are rejected, which keeps distinct pairs from colliding
/// (`"a_b" + "c"` and `"a" + "b_c"` would otherwise both produce `a_b_c`).
pub fn resolve(first: &UserId, second: &UserId) -> ChatResult<ConversationId> {
    ensure_joinable(first)?;
    ensure_joinable(second)?;

    if first == second {
        return InvalidIdentitySnafu {
            stage: "resolve-same-user",
            raw: first.to_string(),
            reason: "a conversation needs two distinct participants",
        }
        .fail();
    }

    let (low, high) = if first < second {
        (first, second)
    } else {
        (second, first)
    };

    ConversationId::parse(format!("{low}{PAIR_SEPARATOR}{high}")).map_err(|_| {
        InvalidIdentitySnafu {
            stage: "resolve-build-id",
            raw: format!("{low}{PAIR_SEPARATOR}{high}"),
            reason: "derived conversation id is empty",
        }
        .build()
    })
}

/// Parses a raw user id and checks it can take part in [`resolve`].
pub fn parse_user(raw: &str) -> ChatResult<UserId> {
    let user_id = UserId::parse(raw).map_err(|_| {
        InvalidIdentitySnafu {
            stage: "parse-user-empty",
            raw: raw.to_string(),
            reason: "user id is empty",
        }
        .build()
    })?;
    ensure_joinable(&user_id)?;
    Ok(user_id)
}

fn ensure_joinable(user_id: &UserId) -> ChatResult<()> {
    if user_id.as_str().contains(PAIR_SEPARATOR) {
        return InvalidIdentitySnafu {
            stage: "resolve-separator-in-id",
            raw: user_id.to_string(),
            reason: "user id contains the pair separator",
        }
        .fail();
    }
    Ok(())
}
