use crate::activity::{ActionKind, ActivityItem, ActorRef};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// How many items one fetch cycle keeps per entity.
pub const FEED_WINDOW: usize = 10;

/// Normalizes the two overlapping upstream lists (the entity's action log
/// and the reactions received on their posts) into one recency-sorted item
/// list. Decoding is fail-open per entry: anything missing its essentials is
/// skipped, never an error, so a partially malformed payload degrades to a
/// shorter list rather than an empty cycle.
pub fn normalize_feed(actions: &Value, reactions: &Value) -> Vec<ActivityItem> {
    let mut items = Vec::new();

    if let Some(list) = actions.get("user_actions").and_then(Value::as_array) {
        items.extend(list.iter().filter_map(action_item));
    }
    if let Some(list) = reactions.as_array() {
        items.extend(list.iter().filter_map(reaction_item));
    }

    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    items.truncate(FEED_WINDOW);
    items
}

fn action_item(raw: &Value) -> Option<ActivityItem> {
    let created_at = time_field(raw, "created_at")?;
    let code = raw.get("action_type").and_then(Value::as_u64)?;
    let kind = ActionKind::from_action_type(code)?;

    // Upstream reports likes from the liked post's perspective: `username`
    // is the post author and `acting_username` the one who liked. Swap so
    // `actor` is always who acted.
    let (actor_prefix, acting_prefix) = if kind == ActionKind::Like {
        ("acting_", "")
    } else {
        ("", "acting_")
    };
    let actor = actor_ref(raw, actor_prefix)?;
    let acting = actor_ref(raw, acting_prefix).filter(|a| a.username != actor.username);

    Some(ActivityItem {
        id: None,
        created_at,
        kind,
        actor,
        acting,
        topic_id: raw.get("topic_id").and_then(Value::as_u64),
        post_number: raw.get("post_number").and_then(Value::as_u64),
        title: str_field(raw, "title"),
        excerpt: str_field(raw, "excerpt"),
        category_id: raw.get("category_id").and_then(Value::as_u64),
    })
}

fn reaction_item(raw: &Value) -> Option<ActivityItem> {
    let created_at = time_field(raw, "created_at")?;
    let user = raw.get("user")?;
    let actor = ActorRef {
        username: str_field(user, "username")?,
        name: str_field(user, "name"),
        avatar_template: str_field(user, "avatar_template"),
    };

    let post = raw.get("post");
    let post_user = post.and_then(|p| p.get("user"));
    let acting = post_user
        .and_then(|u| str_field(u, "username"))
        .or_else(|| post.and_then(|p| str_field(p, "username")))
        .map(|username| ActorRef {
            username,
            name: post_user.and_then(|u| str_field(u, "name")),
            avatar_template: post_user.and_then(|u| str_field(u, "avatar_template")),
        });

    let value = raw
        .get("reaction")
        .and_then(|r| str_field(r, "reaction_value"))
        .unwrap_or_else(|| "reaction".to_string());

    Some(ActivityItem {
        id: raw.get("id").and_then(Value::as_u64),
        created_at,
        kind: ActionKind::Reaction(value),
        actor,
        acting,
        topic_id: post.and_then(|p| p.get("topic_id")).and_then(Value::as_u64),
        post_number: post
            .and_then(|p| p.get("post_number"))
            .and_then(Value::as_u64),
        title: post
            .and_then(|p| str_field(p, "topic_title"))
            .or_else(|| post.and_then(|p| p.get("topic")).and_then(|t| str_field(t, "title"))),
        excerpt: post.and_then(|p| str_field(p, "excerpt")),
        category_id: post
            .and_then(|p| p.get("category_id"))
            .and_then(Value::as_u64),
    })
}

fn actor_ref(raw: &Value, prefix: &str) -> Option<ActorRef> {
    Some(ActorRef {
        username: str_field(raw, &format!("{prefix}username"))?,
        name: str_field(raw, &format!("{prefix}name")),
        avatar_template: str_field(raw, &format!("{prefix}avatar_template")),
    })
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn time_field(raw: &Value, key: &str) -> Option<DateTime<Utc>> {
    let text = raw.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
