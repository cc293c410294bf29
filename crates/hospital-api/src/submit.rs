//! The public form submission pipeline.
//!
//! Each step either completes or fails the whole request: rate limit, content type,
//! JSON, envelope, structure, captcha strip, sanitize, attachments, schema, persist.
//! Only after the row is stored is a notification queued, and nothing after that point
//! can fail the request.

use std::sync::Arc;

use chrono::Utc;
use hospital_common::site_api::SubmitResponse;
use serde_json::Value;
use tracing::info;

use crate::attachments::AttachmentUploader;
use crate::error::ApiError;
use crate::forms::FormPayload;
use crate::model::{FormType, NewSubmission, SubmissionMetadata, SubmissionStatus};
use crate::notify::NotificationQueue;
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::store::SubmissionStore;
use crate::validate::{sanitize_form_value, sanitize_string, validate_form_data};

/// Fields that only prove the sender is human. They are never stored.
const VERIFICATION_FIELDS: &[&str] = &[
    "captcha",
    "captchaCode",
    "captchaAnswer",
    "captchaToken",
    "captchaId",
];

const RECEIVED_MESSAGE: &str =
    "Thank you. Your submission has been received and our team will contact you shortly.";

/// Who sent the request, as recorded with the submission.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip: String,
    pub user_agent: String,
}

pub struct SubmissionService {
    limiter: RateLimiter,
    policy: RateLimitPolicy,
    attachments: AttachmentUploader,
    store: Arc<dyn SubmissionStore>,
    notifications: NotificationQueue,
}

impl SubmissionService {
    pub fn new(
        limiter: RateLimiter,
        policy: RateLimitPolicy,
        attachments: AttachmentUploader,
        store: Arc<dyn SubmissionStore>,
        notifications: NotificationQueue,
    ) -> Self {
        Self {
            limiter,
            policy,
            attachments,
            store,
            notifications,
        }
    }

    pub async fn submit(
        &self,
        ctx: &RequestContext,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<SubmitResponse, ApiError> {
        self.limiter.enforce(&self.policy, &ctx.ip).await?;

        let is_json = content_type
            .map(|ct| ct.trim().to_ascii_lowercase().starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(ApiError::bad_request("Content-Type must be application/json"));
        }

        let envelope: Value = serde_json::from_slice(body)
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))?;
        let (form_type, mut data) = parse_envelope(envelope)?;

        validate_form_data(&data).map_err(|e| ApiError::bad_request(e.to_string()))?;
        strip_verification_fields(&mut data);
        let mut data = sanitize_form_value(data);

        let uploaded = self.attachments.resolve(&mut data).await;

        let payload = FormPayload::parse(form_type, data)
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        let form_data = payload
            .to_form_data()
            .map_err(|e| ApiError::Internal(format!("encode form data: {e}")))?;

        let submission = NewSubmission {
            form_type,
            form_data,
            metadata: SubmissionMetadata {
                ip: ctx.ip.clone(),
                user_agent: sanitize_string(&ctx.user_agent, 500),
                timestamp: Utc::now(),
            },
            status: SubmissionStatus::Pending,
        };
        let stored = self
            .store
            .insert(&submission)
            .await
            .map_err(|e| ApiError::Internal(format!("persist {form_type} submission: {e}")))?;
        info!(
            submission_id = %stored.id,
            form_type = %form_type,
            attachments = uploaded,
            "submission stored"
        );

        self.notifications.enqueue(&stored);

        Ok(SubmitResponse {
            success: true,
            submission_id: stored.id,
            message: RECEIVED_MESSAGE.to_string(),
        })
    }
}

/// Split `{formType, data}` into a known form type and an object payload.
fn parse_envelope(envelope: Value) -> Result<(FormType, Value), ApiError> {
    let Value::Object(mut fields) = envelope else {
        return Err(ApiError::bad_request("Request body must be a JSON object"));
    };
    let form_type = match fields.get("formType") {
        Some(Value::String(raw)) => raw
            .parse::<FormType>()
            .map_err(|_| ApiError::bad_request("Invalid form type"))?,
        Some(_) => return Err(ApiError::bad_request("Invalid form type")),
        None => return Err(ApiError::bad_request("formType is required")),
    };
    match fields.remove("data") {
        Some(data @ Value::Object(_)) => Ok((form_type, data)),
        Some(Value::Null) | None => Err(ApiError::bad_request("data is required")),
        Some(_) => Err(ApiError::bad_request("data must be an object")),
    }
}

fn strip_verification_fields(data: &mut Value) {
    if let Value::Object(map) = data {
        for key in VERIFICATION_FIELDS {
            map.remove(*key);
        }
    }
}
