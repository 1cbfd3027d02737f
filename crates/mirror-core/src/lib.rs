//! Core domain records shared by the mirror pipeline: operational source rows,
//! mirrored analytics rows, and run-cycle ledger entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "mirror-core";

/// 1900-01-01T00:00:00Z as unix seconds.
pub const SENTINEL_EPOCH_SECS: i64 = -2_208_988_800;

/// Watermark used when a package has never completed a successful cycle.
pub fn sentinel_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(SENTINEL_EPOCH_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value:?}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

macro_rules! string_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError::new($what, other)),
                }
            }
        }
    };
}

/// Logical pipeline identifier recorded on every run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Package {
    Engagement,
    Survey,
    Submission,
    ReportSetting,
    User,
    EmailVerification,
    #[serde(rename = "userfeedback")]
    UserFeedback,
}

string_enum!(Package, "package", {
    Engagement => "engagement",
    Survey => "survey",
    Submission => "submission",
    ReportSetting => "report_setting",
    User => "user",
    EmailVerification => "email_verification",
    UserFeedback => "userfeedback",
});

/// Kind of mirrored row in the analytics store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Engagement,
    Survey,
    Submission,
    Comment,
    ReportSetting,
    UserDetail,
    EmailVerification,
    Feedback,
}

string_enum!(EntityKind, "entity kind", {
    Engagement => "engagement",
    Survey => "survey",
    Submission => "submission",
    Comment => "comment",
    ReportSetting => "report_setting",
    UserDetail => "user_detail",
    EmailVerification => "email_verification",
    Feedback => "feedback",
});

impl EntityKind {
    /// Versioned kinds keep history through `is_active`; the rest are append-only facts.
    pub fn is_versioned(&self) -> bool {
        matches!(
            self,
            EntityKind::Engagement | EntityKind::Survey | EntityKind::ReportSetting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementStatus {
    Draft,
    Published,
    Closed,
    Scheduled,
    Unpublished,
}

string_enum!(EngagementStatus, "engagement status", {
    Draft => "draft",
    Published => "published",
    Closed => "closed",
    Scheduled => "scheduled",
    Unpublished => "unpublished",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    Pending,
    Approved,
    Rejected,
    NeedsFurtherReview,
}

string_enum!(CommentStatus, "comment status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    NeedsFurtherReview => "needs_further_review",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    Survey,
    Subscribe,
    RejectedComment,
}

string_enum!(VerificationType, "verification type", {
    Survey => "survey",
    Subscribe => "subscribe",
    RejectedComment => "rejected_comment",
});

/// Anything read from the operational store that carries a change timestamp.
pub trait ChangeTracked {
    fn source_id(&self) -> i64;
    fn created_date(&self) -> DateTime<Utc>;
    fn updated_date(&self) -> Option<DateTime<Utc>>;

    /// Timestamp compared against the watermark.
    fn changed_at(&self) -> DateTime<Utc> {
        self.updated_date().unwrap_or_else(|| self.created_date())
    }
}

macro_rules! change_tracked {
    ($($row:ty),+ $(,)?) => {
        $(
            impl ChangeTracked for $row {
                fn source_id(&self) -> i64 {
                    self.id
                }

                fn created_date(&self) -> DateTime<Utc> {
                    self.created_date
                }

                fn updated_date(&self) -> Option<DateTime<Utc>> {
                    self.updated_date
                }
            }
        )+
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementRow {
    pub id: i64,
    pub name: String,
    pub status: EngagementStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub published_date: Option<DateTime<Utc>>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub tenant_id: Option<i64>,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyRow {
    pub id: i64,
    pub name: String,
    pub engagement_id: Option<i64>,
    pub is_hidden: bool,
    pub is_template: bool,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRow {
    pub id: i64,
    pub survey_id: i64,
    pub engagement_id: i64,
    pub user_id: Option<i64>,
    pub submission_json: JsonValue,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: i64,
    pub text: String,
    pub submission_id: i64,
    pub survey_id: i64,
    pub user_id: Option<i64>,
    /// Key of the form field in the submission payload this comment came from.
    pub component_id: String,
    pub status: CommentStatus,
    pub submission_date: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    pub external_id: String,
    pub display_name: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailVerificationRow {
    pub id: i64,
    pub verification_token: String,
    pub survey_id: Option<i64>,
    pub user_id: Option<i64>,
    pub verification_type: VerificationType,
    pub is_active: bool,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSettingRow {
    pub id: i64,
    pub survey_id: i64,
    pub question_id: String,
    pub question_key: String,
    pub question_type: String,
    pub question: String,
    pub display: bool,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRow {
    pub id: i64,
    pub rating: i16,
    pub comment: Option<String>,
    pub comment_type: Option<String>,
    pub source_url: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
}

change_tracked!(
    EngagementRow,
    SurveyRow,
    SubmissionRow,
    CommentRow,
    UserRow,
    EmailVerificationRow,
    ReportSettingRow,
    FeedbackRow,
);

/// One bookkeeping record of a pipeline execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCycle {
    pub id: i64,
    pub package_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub description: String,
}

impl RunCycle {
    pub fn started(id: i64, package: Package, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            package_name: package.as_str().to_string(),
            start_time,
            end_time: None,
            success: false,
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementFacts {
    pub name: String,
    pub status: EngagementStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub published_date: Option<DateTime<Utc>>,
    pub tenant_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyFacts {
    pub name: String,
    /// Destination key of the engagement row.
    pub engagement_key: Option<i64>,
    pub is_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionFacts {
    pub survey_key: i64,
    pub engagement_key: i64,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentFacts {
    pub survey_key: i64,
    pub submission_id: i64,
    pub user_id: Option<i64>,
    pub component_id: String,
    pub text: String,
    pub submission_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSettingFacts {
    pub survey_key: i64,
    pub question_id: String,
    pub question_key: String,
    pub question_type: String,
    pub question: String,
    pub display: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDetailFacts {
    pub external_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailVerificationFacts {
    pub survey_key: Option<i64>,
    pub user_id: Option<i64>,
    pub verification_type: VerificationType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackFacts {
    pub rating: i16,
    pub comment: Option<String>,
    pub comment_type: Option<String>,
    pub source_url: Option<String>,
}

/// Typed destination columns, one variant per mirrored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MirrorPayload {
    Engagement(EngagementFacts),
    Survey(SurveyFacts),
    Submission(SubmissionFacts),
    Comment(CommentFacts),
    ReportSetting(ReportSettingFacts),
    UserDetail(UserDetailFacts),
    EmailVerification(EmailVerificationFacts),
    Feedback(FeedbackFacts),
}

impl MirrorPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            MirrorPayload::Engagement(_) => EntityKind::Engagement,
            MirrorPayload::Survey(_) => EntityKind::Survey,
            MirrorPayload::Submission(_) => EntityKind::Submission,
            MirrorPayload::Comment(_) => EntityKind::Comment,
            MirrorPayload::ReportSetting(_) => EntityKind::ReportSetting,
            MirrorPayload::UserDetail(_) => EntityKind::UserDetail,
            MirrorPayload::EmailVerification(_) => EntityKind::EmailVerification,
            MirrorPayload::Feedback(_) => EntityKind::Feedback,
        }
    }
}

/// Destination row before the store assigns its surrogate key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMirrorRow {
    pub source_id: i64,
    pub is_active: bool,
    pub runcycle_id: i64,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
    pub payload: MirrorPayload,
}

impl NewMirrorRow {
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRow {
    pub key: i64,
    pub source_id: i64,
    pub is_active: bool,
    pub runcycle_id: i64,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
    pub payload: MirrorPayload,
}

impl MirrorRow {
    pub fn from_new(key: i64, row: NewMirrorRow) -> Self {
        Self {
            key,
            source_id: row.source_id,
            is_active: row.is_active,
            runcycle_id: row.runcycle_id,
            created_date: row.created_date,
            updated_date: row.updated_date,
            payload: row.payload,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }
}

/// Dependent source row parked until its parent becomes resolvable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRow {
    pub package: Package,
    pub kind: EntityKind,
    pub source_id: i64,
    pub reason: String,
    pub deferred_at: DateTime<Utc>,
}

/// Comment that qualifies for redaction, joined with its submission payload key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionCandidate {
    pub comment_id: i64,
    pub submission_id: i64,
    pub component_id: String,
    pub text: String,
    pub engagement_id: i64,
    pub engagement_end_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sentinel_epoch_is_1900() {
        let expected = Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(sentinel_epoch(), expected);
    }

    #[test]
    fn package_names_round_trip_through_text() {
        for package in Package::ALL {
            assert_eq!(package.as_str().parse::<Package>().unwrap(), *package);
        }
        assert_eq!(Package::UserFeedback.as_str(), "userfeedback");
        let err = "engagements".parse::<Package>().unwrap_err();
        assert_eq!(err.what, "package");
    }

    #[test]
    fn changed_at_prefers_updated_date() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        let updated = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap();
        let mut user = UserRow {
            id: 3,
            external_id: "idir-3".into(),
            display_name: None,
            created_date: created,
            updated_date: None,
        };
        assert_eq!(user.changed_at(), created);
        user.updated_date = Some(updated);
        assert_eq!(user.changed_at(), updated);
    }

    #[test]
    fn only_dimension_kinds_are_versioned() {
        let versioned = EntityKind::ALL
            .iter()
            .filter(|k| k.is_versioned())
            .copied()
            .collect::<Vec<_>>();
        assert_eq!(
            versioned,
            vec![
                EntityKind::Engagement,
                EntityKind::Survey,
                EntityKind::ReportSetting
            ]
        );
    }
}
