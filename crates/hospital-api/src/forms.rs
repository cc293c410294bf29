//! Typed schemas for the four public forms.
//!
//! The browser posts `{formType, data}`. After sanitation and attachment upload, `data`
//! is parsed into the variant named by `formType`. Known fields are typed; anything
//! else the frontend sends rides along in `extra` so new optional inputs do not need a
//! backend release.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{FormType, StoredFile};

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex"));
static PHONE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9 ()\-]+$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormError {
    #[error("invalid {form_type} form: {message}")]
    Schema { form_type: FormType, message: String },

    #[error("an email address or phone number is required")]
    MissingContact,

    #[error("invalid email address")]
    InvalidEmail,

    #[error("invalid phone number")]
    InvalidPhone,
}

/// How to reach the person who filled in the form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl ContactDetails {
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }

    fn validate(&self) -> Result<(), FormError> {
        let email = self.email.as_deref().filter(|s| !s.is_empty());
        let phone = self.phone.as_deref().filter(|s| !s.is_empty());
        if email.is_none() && phone.is_none() {
            return Err(FormError::MissingContact);
        }
        if let Some(email) = email {
            if !EMAIL.is_match(email) {
                return Err(FormError::InvalidEmail);
            }
        }
        if let Some(phone) = phone {
            let digits = phone.chars().filter(char::is_ascii_digit).count();
            if !PHONE_CHARS.is_match(phone) || !(7..=15).contains(&digits) {
                return Err(FormError::InvalidPhone);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentForm {
    #[serde(flatten)]
    pub contact: ContactDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckupForm {
    #[serde(flatten)]
    pub contact: ContactDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchForm {
    #[serde(flatten)]
    pub contact: ContactDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobForm {
    #[serde(flatten)]
    pub contact: ContactDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<StoredFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_letter: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormPayload {
    Appointment(AppointmentForm),
    Checkup(CheckupForm),
    Research(ResearchForm),
    Job(JobForm),
}

impl FormPayload {
    /// Parse and validate `data` as the schema for `form_type`.
    pub fn parse(form_type: FormType, data: Value) -> Result<Self, FormError> {
        let schema_err = |e: serde_json::Error| FormError::Schema {
            form_type,
            message: e.to_string(),
        };
        let payload = match form_type {
            FormType::Appointment => {
                FormPayload::Appointment(serde_json::from_value(data).map_err(schema_err)?)
            }
            FormType::Checkup => {
                FormPayload::Checkup(serde_json::from_value(data).map_err(schema_err)?)
            }
            FormType::Research => {
                FormPayload::Research(serde_json::from_value(data).map_err(schema_err)?)
            }
            FormType::Job => FormPayload::Job(serde_json::from_value(data).map_err(schema_err)?),
        };
        payload.contact().validate()?;
        Ok(payload)
    }

    pub fn contact(&self) -> &ContactDetails {
        match self {
            FormPayload::Appointment(f) => &f.contact,
            FormPayload::Checkup(f) => &f.contact,
            FormPayload::Research(f) => &f.contact,
            FormPayload::Job(f) => &f.contact,
        }
    }

    /// The JSON stored in the submission's `form_data` column.
    pub fn to_form_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            FormPayload::Appointment(f) => serde_json::to_value(f),
            FormPayload::Checkup(f) => serde_json::to_value(f),
            FormPayload::Research(f) => serde_json::to_value(f),
            FormPayload::Job(f) => serde_json::to_value(f),
        }
    }
}
