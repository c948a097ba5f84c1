use serde::{Deserialize, Serialize};

/// Terminal outcome of an AI invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Success,
    Failed,
    Timeout,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    #[serde(default)]
    pub json_output: bool,
    #[serde(default)]
    pub thinking: bool,
}

/// One completed AI invocation as produced by the invocation framework.
///
/// Records are built once the call has finished, so `status` is always
/// terminal. `frequency` and `last_access_time` are only touched by the
/// in-process [`CallLogCache`](crate::cache::CallLogCache).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub operation_type: String,
    pub model_name: String,
    /// Epoch milliseconds when the call started.
    pub call_time: u64,
    pub duration_millis: u64,
    pub status: CallStatus,
    #[serde(default)]
    pub request_params: RequestParams,
    pub input: Option<String>,
    pub prompt: Option<String>,
    pub raw_response: Option<String>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub frequency: u64,
    #[serde(default)]
    pub last_access_time: u64,
}

impl CallRecord {
    /// A record with a fresh call id and no content.
    pub fn new<O, M>(operation_type: O, model_name: M, status: CallStatus) -> Self
    where
        O: Into<String>,
        M: Into<String>,
    {
        let now = crate::now_epoch_ms();
        CallRecord {
            call_id: new_call_id(),
            operation_type: operation_type.into(),
            model_name: model_name.into(),
            call_time: now,
            duration_millis: 0,
            status,
            request_params: RequestParams::default(),
            input: None,
            prompt: None,
            raw_response: None,
            output: None,
            error_message: None,
            frequency: 0,
            last_access_time: now,
        }
    }
}

/// 128 random bits, hex encoded. Collisions within a process lifetime are
/// not a practical concern.
pub fn new_call_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// The upload projection of a [`CallRecord`].
///
/// Content fields (`input`, `prompt`, `rawResponse`, `output`) are only
/// present when content upload was enabled at projection time. There is no
/// way back from an item to the full record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub call_id: String,
    pub operation_type: String,
    pub model_name: String,
    pub call_time: u64,
    pub duration_millis: u64,
    pub status: CallStatus,
    #[serde(default)]
    pub request_params: RequestParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub frequency: u64,
    #[serde(default)]
    pub last_access_time: u64,
}

impl UploadItem {
    pub fn project(record: &CallRecord, include_content: bool) -> Self {
        let content = |field: &Option<String>| {
            if include_content {
                field.clone()
            } else {
                None
            }
        };

        UploadItem {
            call_id: record.call_id.clone(),
            operation_type: record.operation_type.clone(),
            model_name: record.model_name.clone(),
            call_time: record.call_time,
            duration_millis: record.duration_millis,
            status: record.status,
            request_params: record.request_params.clone(),
            input: content(&record.input),
            prompt: content(&record.prompt),
            raw_response: content(&record.raw_response),
            output: content(&record.output),
            error_message: record.error_message.clone(),
            frequency: record.frequency,
            last_access_time: record.last_access_time,
        }
    }
}

/// One persisted line of the ingestion store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRecord {
    pub tenant_id: String,
    pub app_id: String,
    /// Epoch milliseconds when the server accepted the batch.
    pub ingested_at: u64,
    pub item: UploadItem,
}

/// Wire payload of `POST /v1/logs/ai-calls/batch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch {
    pub contract_version: String,
    pub tenant_id: Option<String>,
    pub app_id: Option<String>,
    #[serde(default)]
    pub items: Vec<UploadItem>,
}

/// Successful response of the batch endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAccepted {
    pub accepted: usize,
    pub tenant_id: String,
    pub app_id: String,
}
