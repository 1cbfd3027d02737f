//! Postgres-backed source and destination stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::{
    CommentRow, DeferredRow, EmailVerificationRow, EngagementRow, EngagementStatus, EntityKind,
    FeedbackRow, MirrorPayload, NewMirrorRow, Package, RedactionCandidate, ReportSettingRow,
    RunCycle, SubmissionRow, SurveyRow, UserRow,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{
    DestinationStore, DestinationTx, PoolConfig, SourceStore, SourceSweepTx, StoreResult,
};

async fn connect(database_url: &str, config: &PoolConfig) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await?;
    Ok(pool)
}

const ENGAGEMENT_COLUMNS: &str = "id, name, status, start_date, end_date, published_date, \
     scheduled_date, tenant_id, created_date, updated_date";
const SURVEY_COLUMNS: &str =
    "id, name, engagement_id, is_hidden, is_template, created_date, updated_date";
const SUBMISSION_COLUMNS: &str =
    "id, survey_id, engagement_id, user_id, submission_json, created_date, updated_date";
const COMMENT_COLUMNS: &str = "id, text, submission_id, survey_id, user_id, component_id, \
     status, submission_date, created_date, updated_date";
const USER_COLUMNS: &str = "id, external_id, display_name, created_date, updated_date";
const EMAIL_VERIFICATION_COLUMNS: &str = "id, verification_token, survey_id, user_id, \
     verification_type, is_active, created_date, updated_date";
const REPORT_SETTING_COLUMNS: &str = "id, survey_id, question_id, question_key, question_type, \
     question, display, created_date, updated_date";
const FEEDBACK_COLUMNS: &str =
    "id, rating, comment, comment_type, source_url, created_date, updated_date";

const CHANGED_SINCE: &str = "COALESCE(updated_date, created_date) > $1";
const BY_IDS: &str = "id = ANY($1)";

fn engagement_from_row(row: &PgRow) -> StoreResult<EngagementRow> {
    Ok(EngagementRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        published_date: row.try_get("published_date")?,
        scheduled_date: row.try_get("scheduled_date")?,
        tenant_id: row.try_get("tenant_id")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

fn survey_from_row(row: &PgRow) -> StoreResult<SurveyRow> {
    Ok(SurveyRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        engagement_id: row.try_get("engagement_id")?,
        is_hidden: row.try_get("is_hidden")?,
        is_template: row.try_get("is_template")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

fn submission_from_row(row: &PgRow) -> StoreResult<SubmissionRow> {
    Ok(SubmissionRow {
        id: row.try_get("id")?,
        survey_id: row.try_get("survey_id")?,
        engagement_id: row.try_get("engagement_id")?,
        user_id: row.try_get("user_id")?,
        submission_json: row.try_get("submission_json")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

fn comment_from_row(row: &PgRow) -> StoreResult<CommentRow> {
    Ok(CommentRow {
        id: row.try_get("id")?,
        text: row.try_get("text")?,
        submission_id: row.try_get("submission_id")?,
        survey_id: row.try_get("survey_id")?,
        user_id: row.try_get("user_id")?,
        component_id: row.try_get("component_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        submission_date: row.try_get("submission_date")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

fn user_from_row(row: &PgRow) -> StoreResult<UserRow> {
    Ok(UserRow {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        display_name: row.try_get("display_name")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

fn email_verification_from_row(row: &PgRow) -> StoreResult<EmailVerificationRow> {
    Ok(EmailVerificationRow {
        id: row.try_get("id")?,
        verification_token: row.try_get("verification_token")?,
        survey_id: row.try_get("survey_id")?,
        user_id: row.try_get("user_id")?,
        verification_type: row.try_get::<String, _>("verification_type")?.parse()?,
        is_active: row.try_get("is_active")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

fn report_setting_from_row(row: &PgRow) -> StoreResult<ReportSettingRow> {
    Ok(ReportSettingRow {
        id: row.try_get("id")?,
        survey_id: row.try_get("survey_id")?,
        question_id: row.try_get("question_id")?,
        question_key: row.try_get("question_key")?,
        question_type: row.try_get("question_type")?,
        question: row.try_get("question")?,
        display: row.try_get("display")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

fn feedback_from_row(row: &PgRow) -> StoreResult<FeedbackRow> {
    Ok(FeedbackRow {
        id: row.try_get("id")?,
        rating: row.try_get("rating")?,
        comment: row.try_get("comment")?,
        comment_type: row.try_get("comment_type")?,
        source_url: row.try_get("source_url")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

/// Read access to the operational database.
#[derive(Debug, Clone)]
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub async fn connect(database_url: &str, config: &PoolConfig) -> StoreResult<Self> {
        Ok(Self {
            pool: connect(database_url, config).await?,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn changed<T>(
        &self,
        columns: &str,
        table: &str,
        since: DateTime<Utc>,
        decode: fn(&PgRow) -> StoreResult<T>,
    ) -> StoreResult<Vec<T>> {
        let sql = format!("SELECT {columns} FROM {table} WHERE {CHANGED_SINCE}");
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        debug!(table, rows = rows.len(), %since, "read change window");
        rows.iter().map(decode).collect()
    }

    async fn by_ids<T>(
        &self,
        columns: &str,
        table: &str,
        ids: &[i64],
        decode: fn(&PgRow) -> StoreResult<T>,
    ) -> StoreResult<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {columns} FROM {table} WHERE {BY_IDS}");
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        rows.iter().map(decode).collect()
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn engagements_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<EngagementRow>> {
        self.changed(ENGAGEMENT_COLUMNS, "engagement", since, engagement_from_row)
            .await
    }

    async fn surveys_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SurveyRow>> {
        self.changed(SURVEY_COLUMNS, "survey", since, survey_from_row).await
    }

    async fn submissions_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SubmissionRow>> {
        self.changed(SUBMISSION_COLUMNS, "submission", since, submission_from_row)
            .await
    }

    async fn comments_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<CommentRow>> {
        self.changed(COMMENT_COLUMNS, "comment", since, comment_from_row).await
    }

    async fn users_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<UserRow>> {
        self.changed(USER_COLUMNS, "app_user", since, user_from_row).await
    }

    async fn email_verifications_changed_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EmailVerificationRow>> {
        self.changed(
            EMAIL_VERIFICATION_COLUMNS,
            "email_verification",
            since,
            email_verification_from_row,
        )
        .await
    }

    async fn report_settings_changed_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ReportSettingRow>> {
        self.changed(
            REPORT_SETTING_COLUMNS,
            "report_setting",
            since,
            report_setting_from_row,
        )
        .await
    }

    async fn feedback_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<FeedbackRow>> {
        self.changed(FEEDBACK_COLUMNS, "feedback", since, feedback_from_row)
            .await
    }

    async fn surveys_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<SurveyRow>> {
        self.by_ids(SURVEY_COLUMNS, "survey", ids, survey_from_row).await
    }

    async fn submissions_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<SubmissionRow>> {
        self.by_ids(SUBMISSION_COLUMNS, "submission", ids, submission_from_row)
            .await
    }

    async fn comments_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<CommentRow>> {
        self.by_ids(COMMENT_COLUMNS, "comment", ids, comment_from_row).await
    }

    async fn report_settings_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<ReportSettingRow>> {
        self.by_ids(
            REPORT_SETTING_COLUMNS,
            "report_setting",
            ids,
            report_setting_from_row,
        )
        .await
    }

    async fn email_verifications_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<EmailVerificationRow>> {
        self.by_ids(
            EMAIL_VERIFICATION_COLUMNS,
            "email_verification",
            ids,
            email_verification_from_row,
        )
        .await
    }

    async fn begin_sweep(&self) -> StoreResult<Box<dyn SourceSweepTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSweepTx { tx }))
    }
}

struct PgSweepTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SourceSweepTx for PgSweepTx {
    async fn rejected_comments_on_closed_engagements(
        &mut self,
        ended_before: DateTime<Utc>,
    ) -> StoreResult<Vec<RedactionCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS comment_id,
                   c.submission_id,
                   c.component_id,
                   c.text,
                   e.id AS engagement_id,
                   e.end_date
              FROM comment c
              JOIN submission s ON s.id = c.submission_id
              JOIN engagement e ON e.id = s.engagement_id
             WHERE c.status = 'rejected'
               AND e.status = 'closed'
               AND e.end_date < $1
             ORDER BY c.id
               FOR UPDATE OF c, s
            "#,
        )
        .bind(ended_before)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RedactionCandidate {
                comment_id: row.try_get("comment_id")?,
                submission_id: row.try_get("submission_id")?,
                component_id: row.try_get("component_id")?,
                text: row.try_get("text")?,
                engagement_id: row.try_get("engagement_id")?,
                engagement_end_date: row.try_get("end_date")?,
            });
        }
        Ok(out)
    }

    async fn redact_comment_text(&mut self, comment_id: i64, text: &str) -> StoreResult<()> {
        sqlx::query("UPDATE comment SET text = $2 WHERE id = $1")
            .bind(comment_id)
            .bind(text)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn redact_submission_field(
        &mut self,
        submission_id: i64,
        key: &str,
        text: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE submission
               SET submission_json = jsonb_set(submission_json, ARRAY[$2::text], to_jsonb($3::text))
             WHERE id = $1
            "#,
        )
        .bind(submission_id)
        .bind(key)
        .bind(text)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn engagements_with_status(
        &mut self,
        status: EngagementStatus,
    ) -> StoreResult<Vec<EngagementRow>> {
        let sql = format!("SELECT {ENGAGEMENT_COLUMNS} FROM engagement WHERE status = $1 FOR UPDATE");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(engagement_from_row).collect()
    }

    async fn set_engagement_status(
        &mut self,
        engagement_id: i64,
        status: EngagementStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE engagement
               SET status = $2,
                   updated_date = $3,
                   published_date = CASE
                       WHEN $2 = 'published' THEN COALESCE(published_date, $3)
                       ELSE published_date
                   END
             WHERE id = $1
            "#,
        )
        .bind(engagement_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn email_verifications_created_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<EmailVerificationRow>> {
        let sql = format!(
            "SELECT {EMAIL_VERIFICATION_COLUMNS} FROM email_verification WHERE created_date < $1"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(email_verification_from_row).collect()
    }

    async fn delete_email_verifications(&mut self, ids: &[i64]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM email_verification WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Analytics table backing each mirrored entity kind.
pub fn mirror_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Engagement => "mirror_engagement",
        EntityKind::Survey => "mirror_survey",
        EntityKind::Submission => "mirror_submission",
        EntityKind::Comment => "mirror_comment",
        EntityKind::ReportSetting => "mirror_report_setting",
        EntityKind::UserDetail => "mirror_user_detail",
        EntityKind::EmailVerification => "mirror_email_verification",
        EntityKind::Feedback => "mirror_feedback",
    }
}

/// Write access to the analytics database.
#[derive(Debug, Clone)]
pub struct PgDestinationStore {
    pool: PgPool,
}

impl PgDestinationStore {
    pub async fn connect(database_url: &str, config: &PoolConfig) -> StoreResult<Self> {
        Ok(Self {
            pool: connect(database_url, config).await?,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DestinationStore for PgDestinationStore {
    async fn begin(&self) -> StoreResult<Box<dyn DestinationTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgDestinationTx { tx }))
    }
}

struct PgDestinationTx {
    tx: Transaction<'static, Postgres>,
}

fn run_cycle_from_row(row: &PgRow) -> StoreResult<RunCycle> {
    Ok(RunCycle {
        id: row.try_get("id")?,
        package_name: row.try_get("package_name")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        success: row.try_get("success")?,
        description: row
            .try_get::<Option<String>, _>("description")?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl DestinationTx for PgDestinationTx {
    async fn lock_run_cycles(&mut self) -> StoreResult<()> {
        sqlx::query("LOCK TABLE etl_runcycle IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn max_run_cycle_id(&mut self) -> StoreResult<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM etl_runcycle")
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(max)
    }

    async fn insert_run_cycle(&mut self, cycle: &RunCycle) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO etl_runcycle (id, package_name, start_time, end_time, success, description)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(cycle.id)
        .bind(&cycle.package_name)
        .bind(cycle.start_time)
        .bind(cycle.end_time)
        .bind(cycle.success)
        .bind(&cycle.description)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_run_cycle_success(
        &mut self,
        id: i64,
        package: Package,
        end_time: DateTime<Utc>,
        description: &str,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE etl_runcycle
               SET success = TRUE,
                   end_time = $3,
                   description = $4
             WHERE id = $1
               AND package_name = $2
            "#,
        )
        .bind(id)
        .bind(package.as_str())
        .bind(end_time)
        .bind(description)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn max_successful_end_time(&mut self, package: Package) -> StoreResult<Option<DateTime<Utc>>> {
        let max: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(end_time) FROM etl_runcycle WHERE package_name = $1 AND success",
        )
        .bind(package.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(max)
    }

    async fn run_cycles(&mut self, package: Option<Package>, limit: usize) -> StoreResult<Vec<RunCycle>> {
        let rows = sqlx::query(
            r#"
            SELECT id, package_name, start_time, end_time, success, description
              FROM etl_runcycle
             WHERE ($1::text IS NULL OR package_name = $1)
             ORDER BY id DESC
             LIMIT $2
            "#,
        )
        .bind(package.map(|p| p.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(run_cycle_from_row).collect()
    }

    async fn find_active_keys(&mut self, kind: EntityKind, source_id: i64) -> StoreResult<Vec<i64>> {
        let sql = format!(
            "SELECT id FROM {} WHERE source_id = $1 AND is_active ORDER BY id",
            mirror_table(kind)
        );
        let keys: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(source_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(keys)
    }

    async fn insert_mirror(&mut self, row: &NewMirrorRow) -> StoreResult<i64> {
        let key: i64 = match &row.payload {
            MirrorPayload::Engagement(f) => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO mirror_engagement
                        (source_id, is_active, runcycle_id, created_date, updated_date,
                         name, status, start_date, end_date, published_date, tenant_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    RETURNING id
                    "#,
                )
                .bind(row.source_id)
                .bind(row.is_active)
                .bind(row.runcycle_id)
                .bind(row.created_date)
                .bind(row.updated_date)
                .bind(&f.name)
                .bind(f.status.as_str())
                .bind(f.start_date)
                .bind(f.end_date)
                .bind(f.published_date)
                .bind(f.tenant_id)
                .fetch_one(&mut *self.tx)
                .await?
            }
            MirrorPayload::Survey(f) => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO mirror_survey
                        (source_id, is_active, runcycle_id, created_date, updated_date,
                         name, engagement_id, is_hidden)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    RETURNING id
                    "#,
                )
                .bind(row.source_id)
                .bind(row.is_active)
                .bind(row.runcycle_id)
                .bind(row.created_date)
                .bind(row.updated_date)
                .bind(&f.name)
                .bind(f.engagement_key)
                .bind(f.is_hidden)
                .fetch_one(&mut *self.tx)
                .await?
            }
            MirrorPayload::Submission(f) => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO mirror_submission
                        (source_id, is_active, runcycle_id, created_date, updated_date,
                         survey_id, engagement_id, user_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    RETURNING id
                    "#,
                )
                .bind(row.source_id)
                .bind(row.is_active)
                .bind(row.runcycle_id)
                .bind(row.created_date)
                .bind(row.updated_date)
                .bind(f.survey_key)
                .bind(f.engagement_key)
                .bind(f.user_id)
                .fetch_one(&mut *self.tx)
                .await?
            }
            MirrorPayload::Comment(f) => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO mirror_comment
                        (source_id, is_active, runcycle_id, created_date, updated_date,
                         survey_id, submission_id, user_id, component_id, text, submission_date)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    RETURNING id
                    "#,
                )
                .bind(row.source_id)
                .bind(row.is_active)
                .bind(row.runcycle_id)
                .bind(row.created_date)
                .bind(row.updated_date)
                .bind(f.survey_key)
                .bind(f.submission_id)
                .bind(f.user_id)
                .bind(&f.component_id)
                .bind(&f.text)
                .bind(f.submission_date)
                .fetch_one(&mut *self.tx)
                .await?
            }
            MirrorPayload::ReportSetting(f) => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO mirror_report_setting
                        (source_id, is_active, runcycle_id, created_date, updated_date,
                         survey_id, question_id, question_key, question_type, question, display)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    RETURNING id
                    "#,
                )
                .bind(row.source_id)
                .bind(row.is_active)
                .bind(row.runcycle_id)
                .bind(row.created_date)
                .bind(row.updated_date)
                .bind(f.survey_key)
                .bind(&f.question_id)
                .bind(&f.question_key)
                .bind(&f.question_type)
                .bind(&f.question)
                .bind(f.display)
                .fetch_one(&mut *self.tx)
                .await?
            }
            MirrorPayload::UserDetail(f) => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO mirror_user_detail
                        (source_id, is_active, runcycle_id, created_date, updated_date,
                         external_id, display_name)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING id
                    "#,
                )
                .bind(row.source_id)
                .bind(row.is_active)
                .bind(row.runcycle_id)
                .bind(row.created_date)
                .bind(row.updated_date)
                .bind(&f.external_id)
                .bind(&f.display_name)
                .fetch_one(&mut *self.tx)
                .await?
            }
            MirrorPayload::EmailVerification(f) => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO mirror_email_verification
                        (source_id, is_active, runcycle_id, created_date, updated_date,
                         survey_id, user_id, verification_type)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    RETURNING id
                    "#,
                )
                .bind(row.source_id)
                .bind(row.is_active)
                .bind(row.runcycle_id)
                .bind(row.created_date)
                .bind(row.updated_date)
                .bind(f.survey_key)
                .bind(f.user_id)
                .bind(f.verification_type.as_str())
                .fetch_one(&mut *self.tx)
                .await?
            }
            MirrorPayload::Feedback(f) => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO mirror_feedback
                        (source_id, is_active, runcycle_id, created_date, updated_date,
                         rating, comment, comment_type, source_url)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    RETURNING id
                    "#,
                )
                .bind(row.source_id)
                .bind(row.is_active)
                .bind(row.runcycle_id)
                .bind(row.created_date)
                .bind(row.updated_date)
                .bind(f.rating)
                .bind(&f.comment)
                .bind(&f.comment_type)
                .bind(&f.source_url)
                .fetch_one(&mut *self.tx)
                .await?
            }
        };
        Ok(key)
    }

    async fn deactivate_mirror(
        &mut self,
        kind: EntityKind,
        key: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET is_active = FALSE, updated_date = $2 WHERE id = $1",
            mirror_table(kind)
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn defer_row(&mut self, row: &DeferredRow) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO etl_deferred (package_name, entity_kind, source_id, reason, deferred_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (package_name, entity_kind, source_id) DO UPDATE
              SET reason = EXCLUDED.reason,
                  deferred_at = EXCLUDED.deferred_at
            "#,
        )
        .bind(row.package.as_str())
        .bind(row.kind.as_str())
        .bind(row.source_id)
        .bind(&row.reason)
        .bind(row.deferred_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn deferred_ids(&mut self, package: Package, kind: EntityKind) -> StoreResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT source_id
              FROM etl_deferred
             WHERE package_name = $1
               AND entity_kind = $2
             ORDER BY source_id
            "#,
        )
        .bind(package.as_str())
        .bind(kind.as_str())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn clear_deferred(
        &mut self,
        package: Package,
        kind: EntityKind,
        source_ids: &[i64],
    ) -> StoreResult<()> {
        if source_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            DELETE FROM etl_deferred
             WHERE package_name = $1
               AND entity_kind = $2
               AND source_id = ANY($3)
            "#,
        )
        .bind(package.as_str())
        .bind(kind.as_str())
        .bind(source_ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_distinct_mirror_table() {
        let mut tables = EntityKind::ALL
            .iter()
            .map(|k| mirror_table(*k))
            .collect::<Vec<_>>();
        tables.sort_unstable();
        tables.dedup();
        assert_eq!(tables.len(), EntityKind::ALL.len());
        assert!(tables.iter().all(|t| t.starts_with("mirror_")));
    }
}
