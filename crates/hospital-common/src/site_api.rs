use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Doctor,
    Facility,
    Package,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultAction {
    Modal,
    Navigate,
}

/// One normalized search hit.
///
/// `action == Navigate` always carries a `url`; `action == Modal` never does. The
/// constructors are the only way to build one, and deserialization re-checks the rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSearchResult")]
pub struct SearchResult {
    id: String,
    #[serde(rename = "type")]
    kind: ResultType,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtitle: Option<String>,
    action: ResultAction,
    url: Option<String>,
}

impl SearchResult {
    /// A result the frontend opens in a modal.
    pub fn modal(id: String, kind: ResultType, title: String, subtitle: Option<String>) -> Self {
        Self {
            id,
            kind,
            title,
            subtitle,
            action: ResultAction::Modal,
            url: None,
        }
    }

    /// A result the frontend navigates to.
    pub fn navigate(
        id: String,
        kind: ResultType,
        title: String,
        subtitle: Option<String>,
        url: String,
    ) -> Self {
        Self {
            id,
            kind,
            title,
            subtitle,
            action: ResultAction::Navigate,
            url: Some(url),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResultType {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn subtitle(&self) -> Option<&str> {
        self.subtitle.as_deref()
    }

    pub fn action(&self) -> ResultAction {
        self.action
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

#[derive(Deserialize)]
struct RawSearchResult {
    id: String,
    #[serde(rename = "type")]
    kind: ResultType,
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    action: ResultAction,
    #[serde(default)]
    url: Option<String>,
}

impl TryFrom<RawSearchResult> for SearchResult {
    type Error = String;

    fn try_from(raw: RawSearchResult) -> Result<Self, Self::Error> {
        match (raw.action, raw.url) {
            (ResultAction::Modal, None) => Ok(Self::modal(raw.id, raw.kind, raw.title, raw.subtitle)),
            (ResultAction::Navigate, Some(url)) => Ok(Self::navigate(
                raw.id,
                raw.kind,
                raw.title,
                raw.subtitle,
                url,
            )),
            (ResultAction::Modal, Some(_)) => Err("modal result must not carry a url".to_string()),
            (ResultAction::Navigate, None) => Err("navigate result requires a url".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none", default)]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub submission_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    pub authenticated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionList<T> {
    pub submissions: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub url: String,
    pub expires_in: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modal_results_serialize_with_null_url() {
        let result = SearchResult::modal(
            "d1".to_string(),
            ResultType::Doctor,
            "Dr. Mehta".to_string(),
            Some("Cardiology".to_string()),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "doctor");
        assert_eq!(json["action"], "modal");
        assert!(json["url"].is_null());
        assert_eq!(json["subtitle"], "Cardiology");
    }

    #[test]
    fn deserialization_rejects_broken_action_url_pairs() {
        let navigate_without_url =
            r#"{"id":"f","type":"facility","title":"ICU","action":"navigate","url":null}"#;
        assert!(serde_json::from_str::<SearchResult>(navigate_without_url).is_err());

        let modal_with_url =
            r#"{"id":"p","type":"package","title":"Basic","action":"modal","url":"/x"}"#;
        assert!(serde_json::from_str::<SearchResult>(modal_with_url).is_err());

        let ok = r#"{"id":"f","type":"facility","title":"ICU","action":"navigate","url":"/facilities/icu"}"#;
        let parsed: SearchResult = serde_json::from_str(ok).unwrap();
        assert_eq!(parsed.url(), Some("/facilities/icu"));
        assert_eq!(parsed.subtitle(), None);
    }

    #[test]
    fn error_body_omits_absent_retry_hint() {
        let body = ErrorBody {
            error: "bad".to_string(),
            retry_after: None,
        };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"error":"bad"}"#);
    }
}
