//! SQLite-backed build and template store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use super::{Database, db_err};
use crate::orchestrator::templates::{
    BuildRecord, BuildStatus, BuildStatusUpdate, NewSnapshotBuild, NewSnapshotTemplate,
    TemplateBuild, TemplateStore,
};
use crate::runtime::types::generate_template_id;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

#[derive(Clone, Debug)]
pub struct SqliteTemplateStore {
    db: Database,
}

impl SqliteTemplateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn parse_uuid(raw: &str) -> SandplaneResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| SandplaneError::Database(format!("invalid uuid '{}': {}", raw, e)))
}

fn parse_time(raw: &str) -> SandplaneResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SandplaneError::Database(format!("invalid timestamp '{}': {}", raw, e)))
}

struct BuildRow {
    id: String,
    team_id: String,
    sandbox_id: String,
    node_id: String,
    status: String,
    reason: Option<String>,
    created_at: String,
    finished_at: Option<String>,
}

impl BuildRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            team_id: row.get(1)?,
            sandbox_id: row.get(2)?,
            node_id: row.get(3)?,
            status: row.get(4)?,
            reason: row.get(5)?,
            created_at: row.get(6)?,
            finished_at: row.get(7)?,
        })
    }

    fn into_record(self) -> SandplaneResult<BuildRecord> {
        Ok(BuildRecord {
            build_id: parse_uuid(&self.id)?,
            team_id: parse_uuid(&self.team_id)?,
            sandbox_id: self.sandbox_id,
            node_id: self.node_id,
            status: self.status.parse()?,
            reason: self.reason,
            created_at: parse_time(&self.created_at)?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

#[async_trait]
impl TemplateStore for SqliteTemplateStore {
    async fn create_snapshot_build(&self, build: &NewSnapshotBuild) -> SandplaneResult<Uuid> {
        let build_id = Uuid::new_v4();
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO builds (id, team_id, sandbox_id, base_template_id, node_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                build_id.to_string(),
                build.team_id.to_string(),
                build.sandbox_id,
                build.base_template_id,
                build.node_id,
                BuildStatus::Snapshotting.as_str(),
                Utc::now().to_rfc3339(),
            ],
        ))?;

        tracing::debug!(
            build_id = %build_id,
            sandbox_id = %build.sandbox_id,
            "Created snapshot build"
        );
        Ok(build_id)
    }

    async fn get_build(&self, build_id: Uuid) -> SandplaneResult<Option<BuildRecord>> {
        let row = {
            let conn = self.db.conn();
            db_err!(
                conn.query_row(
                    "SELECT id, team_id, sandbox_id, node_id, status, reason, created_at, finished_at
                     FROM builds WHERE id = ?1",
                    params![build_id.to_string()],
                    BuildRow::from_row,
                )
                .optional()
            )?
        };

        row.map(BuildRow::into_record).transpose()
    }

    async fn update_build_status(&self, update: &BuildStatusUpdate) -> SandplaneResult<()> {
        let conn = self.db.conn();
        let updated = db_err!(conn.execute(
            "UPDATE builds SET status = ?2, reason = ?3, finished_at = ?4 WHERE id = ?1",
            params![
                update.build_id.to_string(),
                update.status.as_str(),
                update.reason,
                update.finished_at.map(|t| t.to_rfc3339()),
            ],
        ))?;

        if updated == 0 {
            return Err(SandplaneError::Database(format!(
                "build {} not found",
                update.build_id
            )));
        }
        Ok(())
    }

    async fn create_snapshot_template(
        &self,
        template: &NewSnapshotTemplate,
    ) -> SandplaneResult<String> {
        let template_id = generate_template_id();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;
        db_err!(tx.execute(
            "INSERT INTO templates (id, team_id, source_sandbox_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                template_id,
                template.team_id.to_string(),
                template.sandbox_id,
                now
            ],
        ))?;
        db_err!(tx.execute(
            "INSERT INTO template_builds (template_id, build_id, tag, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![template_id, template.build_id.to_string(), template.tag, now],
        ))?;
        db_err!(tx.commit())?;

        Ok(template_id)
    }

    async fn assign_build(
        &self,
        template_id: &str,
        build_id: Uuid,
        tag: &str,
    ) -> SandplaneResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO template_builds (template_id, build_id, tag, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                template_id,
                build_id.to_string(),
                tag,
                Utc::now().to_rfc3339()
            ],
        ))?;
        Ok(())
    }

    async fn create_alias(
        &self,
        namespace: &str,
        alias: &str,
        template_id: &str,
    ) -> SandplaneResult<()> {
        let conn = self.db.conn();
        let inserted = db_err!(conn.execute(
            "INSERT OR IGNORE INTO aliases (namespace, alias, template_id) VALUES (?1, ?2, ?3)",
            params![namespace, alias, template_id],
        ))?;

        if inserted == 0 {
            return Err(SandplaneError::AlreadyExists(format!(
                "alias {}/{}",
                namespace, alias
            )));
        }
        Ok(())
    }

    async fn find_template_by_alias(
        &self,
        namespace: &str,
        alias: &str,
    ) -> SandplaneResult<Option<String>> {
        let conn = self.db.conn();
        db_err!(
            conn.query_row(
                "SELECT template_id FROM aliases WHERE namespace = ?1 AND alias = ?2",
                params![namespace, alias],
                |row| row.get(0),
            )
            .optional()
        )
    }

    async fn list_template_builds(&self, template_id: &str) -> SandplaneResult<Vec<TemplateBuild>> {
        let rows: Vec<(String, String)> = {
            let conn = self.db.conn();
            let mut stmt = db_err!(conn.prepare(
                "SELECT build_id, tag FROM template_builds WHERE template_id = ?1 ORDER BY created_at"
            ))?;
            let mapped = db_err!(stmt.query_map(params![template_id], |row| Ok((
                row.get(0)?,
                row.get(1)?
            ))))?;
            db_err!(mapped.collect::<rusqlite::Result<Vec<_>>>())?
        };

        rows.into_iter()
            .map(|(build_id, tag)| {
                Ok(TemplateBuild {
                    build_id: parse_uuid(&build_id)?,
                    tag,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, SqliteTemplateStore) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("templates.db")).unwrap();
        (dir, SqliteTemplateStore::new(db))
    }

    fn new_build() -> NewSnapshotBuild {
        NewSnapshotBuild {
            team_id: Uuid::new_v4(),
            sandbox_id: "sbx".into(),
            base_template_id: "base".into(),
            node_id: "node-1".into(),
        }
    }

    #[tokio::test]
    async fn test_build_lifecycle() {
        let (_dir, store) = create_test_store();
        let build_id = store.create_snapshot_build(&new_build()).await.unwrap();

        let build = store.get_build(build_id).await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Snapshotting);
        assert!(build.finished_at.is_none());

        store
            .update_build_status(&BuildStatusUpdate::failed(build_id, "checkpoint exploded"))
            .await
            .unwrap();
        let build = store.get_build(build_id).await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.reason.as_deref(), Some("checkpoint exploded"));
        assert!(build.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_build_fails() {
        let (_dir, store) = create_test_store();
        let err = store
            .update_build_status(&BuildStatusUpdate::uploaded(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_template_alias_and_assignment() {
        let (_dir, store) = create_test_store();
        let build = new_build();
        let first = store.create_snapshot_build(&build).await.unwrap();

        let template_id = store
            .create_snapshot_template(&NewSnapshotTemplate {
                team_id: build.team_id,
                sandbox_id: build.sandbox_id.clone(),
                build_id: first,
                tag: "v1".into(),
            })
            .await
            .unwrap();
        store.create_alias("acme", "snap", &template_id).await.unwrap();

        assert_eq!(
            store.find_template_by_alias("acme", "snap").await.unwrap(),
            Some(template_id.clone())
        );
        assert_eq!(store.find_template_by_alias("other", "snap").await.unwrap(), None);

        let second = store.create_snapshot_build(&build).await.unwrap();
        store.assign_build(&template_id, second, "v2").await.unwrap();

        let builds = store.list_template_builds(&template_id).await.unwrap();
        assert_eq!(builds.len(), 2);
        assert!(builds.contains(&TemplateBuild { build_id: first, tag: "v1".into() }));
        assert!(builds.contains(&TemplateBuild { build_id: second, tag: "v2".into() }));
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejected() {
        let (_dir, store) = create_test_store();
        let build = new_build();
        let build_id = store.create_snapshot_build(&build).await.unwrap();
        let template_id = store
            .create_snapshot_template(&NewSnapshotTemplate {
                team_id: build.team_id,
                sandbox_id: build.sandbox_id,
                build_id,
                tag: "default".into(),
            })
            .await
            .unwrap();

        store.create_alias("acme", "snap", &template_id).await.unwrap();
        let err = store
            .create_alias("acme", "snap", &template_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SandplaneError::AlreadyExists(_)));
    }
}
