//! Teams, environments, apps, versions, tokens, and runner registration.
//!
//! The user-facing CRUD surface lives outside the core; these operations back
//! run creation, auth lookups, and the seeding paths the tests drive.

use minitower_core::{now_ms, TokenRole};
use serde_json::Value;
use sqlx::types::Json;

use crate::error::{conflict_on_unique, Result, StoreError};
use crate::model::{ApiToken, App, AppVersion, Environment, Runner, Team};
use crate::Store;

/// Slugs are DNS-label-ish: lowercase alphanumerics and dashes, no leading
/// dash, at most 63 bytes.
pub(crate) fn validate_slug(slug: &str) -> Result<()> {
    let ok = !slug.is_empty()
        && slug.len() <= 63
        && !slug.starts_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidInput(format!("invalid slug {slug:?}")))
    }
}

#[derive(Debug, Clone)]
pub struct NewVersion<'a> {
    pub entrypoint: &'a str,
    pub timeout_seconds: Option<i64>,
    pub input_schema: Option<Value>,
    pub artifact_key: &'a str,
    pub artifact_sha256: &'a str,
}

impl Store {
    /// Create a team; its `default` environment is provisioned in the same
    /// transaction.
    pub async fn create_team(&self, slug: &str) -> Result<Team> {
        validate_slug(slug)?;
        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let team: Team = sqlx::query_as(
            "INSERT INTO teams (slug, created_at) VALUES (?, ?) RETURNING *",
        )
        .bind(slug)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, "team slug already taken"))?;

        sqlx::query("INSERT INTO environments (team_id, name, created_at) VALUES (?, 'default', ?)")
            .bind(team.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(team)
    }

    /// Create a named environment; idempotent on `(team, name)`.
    pub async fn create_environment(&self, team_id: i64, name: &str) -> Result<Environment> {
        validate_slug(name)?;
        sqlx::query(
            "INSERT INTO environments (team_id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT (team_id, name) DO NOTHING",
        )
        .bind(team_id)
        .bind(name)
        .bind(now_ms())
        .execute(&self.write)
        .await?;

        let env: Option<Environment> =
            sqlx::query_as("SELECT * FROM environments WHERE team_id = ? AND name = ?")
                .bind(team_id)
                .bind(name)
                .fetch_optional(&self.read)
                .await?;
        env.ok_or(StoreError::NotFound("environment"))
    }

    pub async fn create_app(&self, team_id: i64, slug: &str) -> Result<App> {
        validate_slug(slug)?;
        sqlx::query_as("INSERT INTO apps (team_id, slug, created_at) VALUES (?, ?, ?) RETURNING *")
            .bind(team_id)
            .bind(slug)
            .bind(now_ms())
            .fetch_one(&self.write)
            .await
            .map_err(|e| conflict_on_unique(e, "app slug already taken"))
    }

    /// Publish an immutable version; the number is assigned as `max(prev)+1`
    /// for the app inside one transaction.
    pub async fn publish_version(&self, app_id: i64, v: NewVersion<'_>) -> Result<AppVersion> {
        if v.entrypoint.is_empty() {
            return Err(StoreError::InvalidInput("entrypoint must not be empty".into()));
        }
        if let Some(schema) = &v.input_schema {
            jsonschema::JSONSchema::compile(schema)
                .map_err(|e| StoreError::InvalidInput(format!("input schema: {e}")))?;
        }

        let now = now_ms();
        let mut tx = self.write.begin().await?;

        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM app_versions WHERE app_id = ?",
        )
        .bind(app_id)
        .fetch_one(&mut *tx)
        .await?;

        let row: AppVersion = sqlx::query_as(
            "INSERT INTO app_versions
               (app_id, version, entrypoint, timeout_seconds, input_schema,
                artifact_key, artifact_sha256, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(app_id)
        .bind(version)
        .bind(v.entrypoint)
        .bind(v.timeout_seconds)
        .bind(v.input_schema.map(Json))
        .bind(v.artifact_key)
        .bind(v.artifact_sha256)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Persist the hash of a freshly minted API token.
    pub async fn issue_api_token(
        &self,
        team_id: i64,
        role: TokenRole,
        token_hash: &str,
    ) -> Result<ApiToken> {
        sqlx::query_as(
            "INSERT INTO api_tokens (team_id, token_hash, role, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING *",
        )
        .bind(team_id)
        .bind(token_hash)
        .bind(role)
        .bind(now_ms())
        .fetch_one(&self.write)
        .await
        .map_err(|e| conflict_on_unique(e, "token already exists"))
    }

    pub async fn find_api_token(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        Ok(
            sqlx::query_as("SELECT * FROM api_tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.read)
                .await?,
        )
    }

    /// Register a worker; names are globally unique.
    pub async fn register_runner(
        &self,
        name: &str,
        environment: &str,
        token_hash: &str,
    ) -> Result<Runner> {
        if name.is_empty() || environment.is_empty() {
            return Err(StoreError::InvalidInput(
                "runner name and environment must not be empty".into(),
            ));
        }
        let now = now_ms();
        sqlx::query_as(
            "INSERT INTO runners (name, environment, token_hash, status, last_seen_at, created_at)
             VALUES (?, ?, ?, 'online', ?, ?)
             RETURNING *",
        )
        .bind(name)
        .bind(environment)
        .bind(token_hash)
        .bind(now)
        .bind(now)
        .fetch_one(&self.write)
        .await
        .map_err(|e| conflict_on_unique(e, "runner name already taken"))
    }

    pub async fn find_runner_by_token(&self, token_hash: &str) -> Result<Option<Runner>> {
        Ok(sqlx::query_as("SELECT * FROM runners WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.read)
            .await?)
    }

    pub async fn get_runner(&self, runner_id: i64) -> Result<Runner> {
        let runner: Option<Runner> = sqlx::query_as("SELECT * FROM runners WHERE id = ?")
            .bind(runner_id)
            .fetch_optional(&self.read)
            .await?;
        runner.ok_or(StoreError::NotFound("runner"))
    }
}
