//! Seeded in-memory stores for `--dev`, so every job can be exercised
//! without a database.

use chrono::{Duration, Utc};
use mirror_core::{
    CommentRow, CommentStatus, EmailVerificationRow, EngagementRow, EngagementStatus, FeedbackRow,
    ReportSettingRow, SubmissionRow, SurveyRow, UserRow, VerificationType,
};
use mirror_storage::{InMemoryDestinationStore, InMemorySourceStore};
use serde_json::json;

pub async fn seeded_stores() -> (InMemorySourceStore, InMemoryDestinationStore) {
    let source = InMemorySourceStore::new();
    let now = Utc::now();
    let last_quarter = now - Duration::days(90);

    let engagements = [
        (1, "Transit corridor plan", EngagementStatus::Published, now - Duration::days(20), now + Duration::days(10), None),
        (2, "Parks budget", EngagementStatus::Closed, last_quarter, now - Duration::days(45), None),
        (3, "Library hours", EngagementStatus::Published, now - Duration::days(60), now - Duration::days(1), None),
        (4, "Waterfront design", EngagementStatus::Scheduled, now + Duration::minutes(2), now + Duration::days(30), Some(now + Duration::minutes(2))),
        (5, "Draft idea", EngagementStatus::Draft, now, now + Duration::days(30), None),
    ];
    for (id, name, status, start, end, scheduled) in engagements {
        source
            .put_engagement(EngagementRow {
                id,
                name: name.to_string(),
                status,
                start_date: start,
                end_date: end,
                published_date: (status != EngagementStatus::Draft && status != EngagementStatus::Scheduled)
                    .then_some(start),
                scheduled_date: scheduled,
                tenant_id: Some(1),
                created_date: last_quarter,
                updated_date: Some(start.min(now)),
            })
            .await;
    }

    for (id, engagement_id) in [(10, Some(1)), (11, Some(2)), (12, None)] {
        source
            .put_survey(SurveyRow {
                id,
                name: format!("Survey {id}"),
                engagement_id,
                is_hidden: false,
                is_template: false,
                created_date: last_quarter,
                updated_date: None,
            })
            .await;
    }

    source
        .put_report_setting(ReportSettingRow {
            id: 1,
            survey_id: 10,
            question_id: "q-route".into(),
            question_key: "route".into(),
            question_type: "radio".into(),
            question: "Which route do you prefer?".into(),
            display: true,
            created_date: last_quarter,
            updated_date: None,
        })
        .await;

    for (id, display_name) in [(100, "Avery"), (101, "Sam")] {
        source
            .put_user(UserRow {
                id,
                external_id: format!("ext-{id}"),
                display_name: Some(display_name.to_string()),
                created_date: last_quarter,
                updated_date: None,
            })
            .await;
    }

    source
        .put_submission(SubmissionRow {
            id: 200,
            survey_id: 10,
            engagement_id: 1,
            user_id: Some(100),
            submission_json: json!({ "route": "north", "comments": "More buses please" }),
            created_date: now - Duration::days(5),
            updated_date: None,
        })
        .await;
    source
        .put_submission(SubmissionRow {
            id: 201,
            survey_id: 11,
            engagement_id: 2,
            user_id: Some(101),
            submission_json: json!({ "comments": "something unprintable" }),
            created_date: last_quarter,
            updated_date: None,
        })
        .await;

    source
        .put_comment(CommentRow {
            id: 300,
            text: "More buses please".into(),
            submission_id: 200,
            survey_id: 10,
            user_id: Some(100),
            component_id: "comments".into(),
            status: CommentStatus::Approved,
            submission_date: now - Duration::days(5),
            created_date: now - Duration::days(5),
            updated_date: None,
        })
        .await;
    source
        .put_comment(CommentRow {
            id: 301,
            text: "something unprintable".into(),
            submission_id: 201,
            survey_id: 11,
            user_id: Some(101),
            component_id: "comments".into(),
            status: CommentStatus::Rejected,
            submission_date: last_quarter,
            created_date: last_quarter,
            updated_date: None,
        })
        .await;

    for (id, created) in [(400, last_quarter), (401, now - Duration::days(1))] {
        source
            .put_email_verification(EmailVerificationRow {
                id,
                verification_token: format!("token-{id}"),
                survey_id: Some(10),
                user_id: Some(100),
                verification_type: VerificationType::Survey,
                is_active: true,
                created_date: created,
                updated_date: None,
            })
            .await;
    }

    source
        .put_feedback(FeedbackRow {
            id: 500,
            rating: 4,
            comment: Some("Easy to use".into()),
            comment_type: Some("general".into()),
            source_url: Some("/engagements/1".into()),
            created_date: now - Duration::days(2),
            updated_date: None,
        })
        .await;

    (source, InMemoryDestinationStore::new())
}
