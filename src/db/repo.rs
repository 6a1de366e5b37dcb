use super::model::{required, Invalid, NotFound, Reorderable};
use super::Pool;
use crate::model::{
    Group, GroupInput, Item, ItemInput, ItemStatus, Note, NoteInput, Quote, QuoteInput,
    ReorderEntry, Settings, SettingsInput,
};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

const GROUP_COLUMNS: &str = r#"id, name, "order", icon, color, collapsed, created_at, updated_at"#;
const ITEM_COLUMNS: &str =
    r#"id, title, notes, status, "order", due_date, group_id, created_at, updated_at"#;
const SETTINGS_COLUMNS: &str = "id, title, theme, show_quotes, show_notes, show_mail, due_soon_days, header_image, notification_sound, updated_at";

async fn next_order(pool: &Pool, table: &str) -> Result<i64> {
    let sql = format!(r#"SELECT COALESCE(MAX("order"), -1) + 1 FROM {}"#, table);
    let next: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(next)
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn list_groups(pool: &Pool) -> Result<Vec<Group>> {
    let sql = format!(r#"SELECT {} FROM groups ORDER BY "order", id"#, GROUP_COLUMNS);
    Ok(sqlx::query_as::<_, Group>(&sql).fetch_all(pool).await?)
}

#[instrument(skip_all)]
pub async fn get_group(pool: &Pool, id: i64) -> Result<Option<Group>> {
    let sql = format!("SELECT {} FROM groups WHERE id = ?", GROUP_COLUMNS);
    Ok(sqlx::query_as::<_, Group>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

#[instrument(skip_all)]
pub async fn create_group(pool: &Pool, input: &GroupInput) -> Result<Group> {
    let name = required(input.name.as_ref(), "name")?;
    let order = match input.order {
        Some(order) => order,
        None => next_order(pool, "groups").await?,
    };
    let now = Utc::now();
    let sql = format!(
        r#"INSERT INTO groups (name, "order", icon, color, collapsed, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {}"#,
        GROUP_COLUMNS
    );
    let group = sqlx::query_as::<_, Group>(&sql)
        .bind(name)
        .bind(order)
        .bind(input.icon.clone().flatten())
        .bind(input.color.clone().flatten())
        .bind(input.collapsed.unwrap_or(false))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await?;
    Ok(group)
}

#[instrument(skip_all)]
pub async fn update_group(pool: &Pool, id: i64, input: &GroupInput) -> Result<Group> {
    let mut group = get_group(pool, id)
        .await?
        .ok_or(NotFound::new("group", id))?;
    if input.name.is_some() {
        group.name = required(input.name.as_ref(), "name")?;
    }
    if let Some(order) = input.order {
        group.order = order;
    }
    if let Some(icon) = &input.icon {
        group.icon = icon.clone();
    }
    if let Some(color) = &input.color {
        group.color = color.clone();
    }
    if let Some(collapsed) = input.collapsed {
        group.collapsed = collapsed;
    }
    group.updated_at = Utc::now();
    sqlx::query(
        r#"UPDATE groups SET name = ?, "order" = ?, icon = ?, color = ?, collapsed = ?, updated_at = ? WHERE id = ?"#,
    )
    .bind(&group.name)
    .bind(group.order)
    .bind(&group.icon)
    .bind(&group.color)
    .bind(group.collapsed)
    .bind(group.updated_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(group)
}

/// Deleting a group detaches its items (`group_id` becomes NULL).
#[instrument(skip_all)]
pub async fn delete_group(pool: &Pool, id: i64) -> Result<()> {
    let res = sqlx::query("DELETE FROM groups WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(NotFound::new("group", id).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn list_items(pool: &Pool, group_id: Option<i64>) -> Result<Vec<Item>> {
    let items = match group_id {
        Some(gid) => {
            let sql = format!(
                r#"SELECT {} FROM items WHERE group_id = ? ORDER BY "order", id"#,
                ITEM_COLUMNS
            );
            sqlx::query_as::<_, Item>(&sql)
                .bind(gid)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!(r#"SELECT {} FROM items ORDER BY "order", id"#, ITEM_COLUMNS);
            sqlx::query_as::<_, Item>(&sql).fetch_all(pool).await?
        }
    };
    Ok(items)
}

#[instrument(skip_all)]
pub async fn get_item(pool: &Pool, id: i64) -> Result<Option<Item>> {
    let sql = format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS);
    Ok(sqlx::query_as::<_, Item>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

async fn ensure_group_exists(pool: &Pool, group_id: Option<i64>) -> Result<()> {
    if let Some(gid) = group_id {
        if get_group(pool, gid).await?.is_none() {
            return Err(NotFound::new("group", gid).into());
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_item(pool: &Pool, input: &ItemInput) -> Result<Item> {
    let title = required(input.title.as_ref(), "title")?;
    let group_id = input.group_id.flatten();
    ensure_group_exists(pool, group_id).await?;
    let order = match input.order {
        Some(order) => order,
        None => next_order(pool, "items").await?,
    };
    let now = Utc::now();
    let sql = format!(
        r#"INSERT INTO items (title, notes, status, "order", due_date, group_id, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}"#,
        ITEM_COLUMNS
    );
    let item = sqlx::query_as::<_, Item>(&sql)
        .bind(title)
        .bind(input.notes.clone().flatten())
        .bind(input.status.unwrap_or_default().as_str())
        .bind(order)
        .bind(input.due_date.flatten())
        .bind(group_id)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await?;
    Ok(item)
}

#[instrument(skip_all)]
pub async fn update_item(pool: &Pool, id: i64, input: &ItemInput) -> Result<Item> {
    let mut item = get_item(pool, id).await?.ok_or(NotFound::new("item", id))?;
    if input.title.is_some() {
        item.title = required(input.title.as_ref(), "title")?;
    }
    if let Some(notes) = &input.notes {
        item.notes = notes.clone();
    }
    if let Some(status) = input.status {
        item.status = status;
    }
    if let Some(order) = input.order {
        item.order = order;
    }
    if let Some(due) = input.due_date {
        item.due_date = due;
    }
    if let Some(group_id) = input.group_id {
        ensure_group_exists(pool, group_id).await?;
        item.group_id = group_id;
    }
    item.updated_at = Utc::now();
    sqlx::query(
        r#"UPDATE items SET title = ?, notes = ?, status = ?, "order" = ?, due_date = ?, group_id = ?, updated_at = ? WHERE id = ?"#,
    )
    .bind(&item.title)
    .bind(&item.notes)
    .bind(item.status.as_str())
    .bind(item.order)
    .bind(item.due_date)
    .bind(item.group_id)
    .bind(item.updated_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(item)
}

#[instrument(skip_all)]
pub async fn delete_item(pool: &Pool, id: i64) -> Result<()> {
    let res = sqlx::query("DELETE FROM items WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(NotFound::new("item", id).into());
    }
    Ok(())
}

/// Open items (anything but green) due before `now + days`, overdue ones
/// included, soonest first.
#[instrument(skip_all)]
pub async fn due_soon_items(pool: &Pool, now: DateTime<Utc>, days: i64) -> Result<Vec<Item>> {
    let sql = format!(
        "SELECT {} FROM items WHERE due_date IS NOT NULL AND status != ?",
        ITEM_COLUMNS
    );
    let horizon = now + Duration::days(days.max(0));
    let mut items: Vec<Item> = sqlx::query_as::<_, Item>(&sql)
        .bind(ItemStatus::Green.as_str())
        .fetch_all(pool)
        .await?
        .into_iter()
        .filter(|item| item.due_date.map(|d| d <= horizon).unwrap_or(false))
        .collect();
    items.sort_by_key(|item| (item.due_date, item.id));
    Ok(items)
}

// ---------------------------------------------------------------------------
// Reordering
// ---------------------------------------------------------------------------

/// Write every `order` verbatim in one transaction. An unknown id aborts the
/// whole batch with [`NotFound`].
#[instrument(skip_all, fields(table = target.table(), count = entries.len()))]
pub async fn reorder(pool: &Pool, target: Reorderable, entries: &[ReorderEntry]) -> Result<()> {
    let sql = format!(
        r#"UPDATE {} SET "order" = ?, updated_at = ? WHERE id = ?"#,
        target.table()
    );
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    for entry in entries {
        let res = sqlx::query(&sql)
            .bind(entry.order)
            .bind(now)
            .bind(entry.id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(NotFound::new(target.entity(), entry.id).into());
        }
    }
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn list_quotes(pool: &Pool) -> Result<Vec<Quote>> {
    Ok(
        sqlx::query_as::<_, Quote>("SELECT id, text, author, created_at FROM quotes ORDER BY id")
            .fetch_all(pool)
            .await?,
    )
}

#[instrument(skip_all)]
pub async fn get_quote(pool: &Pool, id: i64) -> Result<Option<Quote>> {
    Ok(
        sqlx::query_as::<_, Quote>("SELECT id, text, author, created_at FROM quotes WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?,
    )
}

#[instrument(skip_all)]
pub async fn random_quote(pool: &Pool) -> Result<Option<Quote>> {
    Ok(sqlx::query_as::<_, Quote>(
        "SELECT id, text, author, created_at FROM quotes ORDER BY RANDOM() LIMIT 1",
    )
    .fetch_optional(pool)
    .await?)
}

/// The quote after `after` by id, wrapping around to the first one.
#[instrument(skip_all)]
pub async fn next_quote(pool: &Pool, after: Option<i64>) -> Result<Option<Quote>> {
    let next = sqlx::query_as::<_, Quote>(
        "SELECT id, text, author, created_at FROM quotes WHERE id > ? ORDER BY id LIMIT 1",
    )
    .bind(after.unwrap_or(i64::MIN))
    .fetch_optional(pool)
    .await?;
    if next.is_some() {
        return Ok(next);
    }
    Ok(sqlx::query_as::<_, Quote>(
        "SELECT id, text, author, created_at FROM quotes ORDER BY id LIMIT 1",
    )
    .fetch_optional(pool)
    .await?)
}

#[instrument(skip_all)]
pub async fn create_quote(pool: &Pool, input: &QuoteInput) -> Result<Quote> {
    let text = required(input.text.as_ref(), "text")?;
    let quote = sqlx::query_as::<_, Quote>(
        "INSERT INTO quotes (text, author, created_at) VALUES (?, ?, ?) RETURNING id, text, author, created_at",
    )
    .bind(text)
    .bind(input.author.clone().flatten())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(quote)
}

#[instrument(skip_all)]
pub async fn update_quote(pool: &Pool, id: i64, input: &QuoteInput) -> Result<Quote> {
    let mut quote = get_quote(pool, id)
        .await?
        .ok_or(NotFound::new("quote", id))?;
    if input.text.is_some() {
        quote.text = required(input.text.as_ref(), "text")?;
    }
    if let Some(author) = &input.author {
        quote.author = author.clone();
    }
    sqlx::query("UPDATE quotes SET text = ?, author = ? WHERE id = ?")
        .bind(&quote.text)
        .bind(&quote.author)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(quote)
}

#[instrument(skip_all)]
pub async fn delete_quote(pool: &Pool, id: i64) -> Result<()> {
    let res = sqlx::query("DELETE FROM quotes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(NotFound::new("quote", id).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Notes
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn list_notes(pool: &Pool) -> Result<Vec<Note>> {
    Ok(sqlx::query_as::<_, Note>(
        "SELECT id, title, content, created_at, updated_at FROM notes ORDER BY updated_at DESC, id DESC",
    )
    .fetch_all(pool)
    .await?)
}

#[instrument(skip_all)]
pub async fn get_note(pool: &Pool, id: i64) -> Result<Option<Note>> {
    Ok(sqlx::query_as::<_, Note>(
        "SELECT id, title, content, created_at, updated_at FROM notes WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

#[instrument(skip_all)]
pub async fn create_note(pool: &Pool, input: &NoteInput) -> Result<Note> {
    let now = Utc::now();
    let note = sqlx::query_as::<_, Note>(
        "INSERT INTO notes (title, content, created_at, updated_at) VALUES (?, ?, ?, ?) RETURNING id, title, content, created_at, updated_at",
    )
    .bind(input.title.clone().unwrap_or_default())
    .bind(input.content.clone().unwrap_or_default())
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(note)
}

#[instrument(skip_all)]
pub async fn update_note(pool: &Pool, id: i64, input: &NoteInput) -> Result<Note> {
    let mut note = get_note(pool, id).await?.ok_or(NotFound::new("note", id))?;
    if let Some(title) = &input.title {
        note.title = title.clone();
    }
    if let Some(content) = &input.content {
        note.content = content.clone();
    }
    note.updated_at = Utc::now();
    sqlx::query("UPDATE notes SET title = ?, content = ?, updated_at = ? WHERE id = ?")
        .bind(&note.title)
        .bind(&note.content)
        .bind(note.updated_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(note)
}

#[instrument(skip_all)]
pub async fn delete_note(pool: &Pool, id: i64) -> Result<()> {
    let res = sqlx::query("DELETE FROM notes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(NotFound::new("note", id).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The singleton settings row, created with defaults when missing.
#[instrument(skip_all)]
pub async fn get_settings(pool: &Pool) -> Result<Settings> {
    sqlx::query("INSERT OR IGNORE INTO settings (id, updated_at) VALUES (1, ?)")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    let sql = format!("SELECT {} FROM settings WHERE id = 1", SETTINGS_COLUMNS);
    Ok(sqlx::query_as::<_, Settings>(&sql).fetch_one(pool).await?)
}

#[instrument(skip_all)]
pub async fn update_settings(pool: &Pool, input: &SettingsInput) -> Result<Settings> {
    let mut settings = get_settings(pool).await?;
    if let Some(title) = &input.title {
        settings.title = title.clone();
    }
    if let Some(theme) = &input.theme {
        settings.theme = theme.clone();
    }
    if let Some(v) = input.show_quotes {
        settings.show_quotes = v;
    }
    if let Some(v) = input.show_notes {
        settings.show_notes = v;
    }
    if let Some(v) = input.show_mail {
        settings.show_mail = v;
    }
    if let Some(days) = input.due_soon_days {
        if days < 0 {
            return Err(Invalid("dueSoonDays must be >= 0".into()).into());
        }
        settings.due_soon_days = days;
    }
    settings.updated_at = Utc::now();
    sqlx::query(
        "UPDATE settings SET title = ?, theme = ?, show_quotes = ?, show_notes = ?, show_mail = ?, due_soon_days = ?, updated_at = ? WHERE id = 1",
    )
    .bind(&settings.title)
    .bind(&settings.theme)
    .bind(settings.show_quotes)
    .bind(settings.show_notes)
    .bind(settings.show_mail)
    .bind(settings.due_soon_days)
    .bind(settings.updated_at)
    .execute(pool)
    .await?;
    Ok(settings)
}

#[instrument(skip_all)]
pub async fn set_header_image(pool: &Pool, url: &str) -> Result<Settings> {
    get_settings(pool).await?;
    sqlx::query("UPDATE settings SET header_image = ?, updated_at = ? WHERE id = 1")
        .bind(url)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    get_settings(pool).await
}

#[instrument(skip_all)]
pub async fn set_notification_sound(pool: &Pool, url: &str) -> Result<Settings> {
    get_settings(pool).await?;
    sqlx::query("UPDATE settings SET notification_sound = ?, updated_at = ? WHERE id = 1")
        .bind(url)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    get_settings(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_pool, run_migrations};

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn group_named(name: &str) -> GroupInput {
        GroupInput {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn groups_get_increasing_default_order() {
        let pool = setup_pool().await;
        let a = create_group(&pool, &group_named("a")).await.unwrap();
        let b = create_group(&pool, &group_named("b")).await.unwrap();
        assert_eq!(a.order, 0);
        assert_eq!(b.order, 1);

        let err = create_group(&pool, &group_named("  ")).await.unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[tokio::test]
    async fn deleting_group_detaches_items() {
        let pool = setup_pool().await;
        let g = create_group(&pool, &group_named("work")).await.unwrap();
        let item = create_item(
            &pool,
            &ItemInput {
                title: Some("write report".into()),
                group_id: Some(Some(g.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(item.group_id, Some(g.id));

        delete_group(&pool, g.id).await.unwrap();
        let item = get_item(&pool, item.id).await.unwrap().unwrap();
        assert_eq!(item.group_id, None);
    }

    #[tokio::test]
    async fn item_with_unknown_group_is_rejected() {
        let pool = setup_pool().await;
        let err = create_item(
            &pool,
            &ItemInput {
                title: Some("orphan".into()),
                group_id: Some(Some(77)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.downcast_ref::<NotFound>(), Some(&NotFound::new("group", 77)));
    }

    #[tokio::test]
    async fn update_item_clears_due_date_on_null() {
        let pool = setup_pool().await;
        let item = create_item(
            &pool,
            &ItemInput {
                title: Some("dentist".into()),
                due_date: Some(Some(Utc::now())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(item.due_date.is_some());

        let updated = update_item(
            &pool,
            item.id,
            &ItemInput {
                due_date: Some(None),
                status: Some(ItemStatus::Yellow),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.due_date, None);
        assert_eq!(updated.status, ItemStatus::Yellow);
        assert_eq!(updated.title, "dentist");
    }

    #[tokio::test]
    async fn due_soon_skips_done_and_far_items() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let mk = |title: &str, due: DateTime<Utc>, status: ItemStatus| ItemInput {
            title: Some(title.into()),
            due_date: Some(Some(due)),
            status: Some(status),
            ..Default::default()
        };
        create_item(&pool, &mk("tomorrow", now + Duration::days(1), ItemStatus::Red))
            .await
            .unwrap();
        create_item(&pool, &mk("overdue", now - Duration::days(2), ItemStatus::Gray))
            .await
            .unwrap();
        create_item(&pool, &mk("done", now + Duration::hours(1), ItemStatus::Green))
            .await
            .unwrap();
        create_item(&pool, &mk("later", now + Duration::days(30), ItemStatus::Gray))
            .await
            .unwrap();

        let titles: Vec<String> = due_soon_items(&pool, now, 3)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(titles, vec!["overdue", "tomorrow"]);
    }

    #[tokio::test]
    async fn next_quote_wraps_around() {
        let pool = setup_pool().await;
        assert!(next_quote(&pool, None).await.unwrap().is_none());
        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let q = create_quote(
                &pool,
                &QuoteInput {
                    text: Some(text.into()),
                    author: None,
                },
            )
            .await
            .unwrap();
            ids.push(q.id);
        }
        assert_eq!(next_quote(&pool, Some(ids[0])).await.unwrap().unwrap().id, ids[1]);
        assert_eq!(next_quote(&pool, Some(ids[2])).await.unwrap().unwrap().id, ids[0]);
        assert_eq!(next_quote(&pool, None).await.unwrap().unwrap().id, ids[0]);
        assert!(random_quote(&pool).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn settings_singleton_is_created_lazily() {
        let pool = setup_pool().await;
        let s = get_settings(&pool).await.unwrap();
        assert_eq!(s.id, 1);
        assert_eq!(s.title, "Congeal");

        let s = update_settings(
            &pool,
            &SettingsInput {
                title: Some("Home".into()),
                due_soon_days: Some(7),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(s.title, "Home");
        assert_eq!(s.due_soon_days, 7);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
