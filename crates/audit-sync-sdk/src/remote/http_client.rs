//! 基于 reqwest 的 RemoteApi 实现
//!
//! 文章、稽核用 JSON 提交；评估用表单提交；文档用 multipart 上传。

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncSdkError};
use crate::remote::response::{decode_create_response, decode_list_response};
use crate::remote::{CreateResult, RemoteApi, RemoteRecord};
use crate::sdk::{EndpointConfig, HttpClientConfig};
use crate::storage::entities::{EntityKind, ParentRef, RecordPayload};

/// HTTP 服务端客户端
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    endpoints: EndpointConfig,
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>, endpoints: EndpointConfig, config: &HttpClientConfig) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }

        let client = builder
            .build()
            .map_err(|e| SyncSdkError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("✅ HTTP 客户端已创建 (base_url: {})", base_url);

        Ok(Self { client, base_url, endpoints })
    }

    fn url(&self, kind: EntityKind) -> String {
        format!("{}/{}", self.base_url, self.endpoints.path(kind).trim_start_matches('/'))
    }

    /// 发送请求并把响应解码成 CreateResult；只有传输失败才返回 Err
    async fn send_create(&self, request: RequestBuilder, kind: EntityKind) -> Result<CreateResult> {
        let response = request.send().await.map_err(|e| {
            warn!("提交 {} 失败（传输层）: {}", kind, e);
            SyncSdkError::Network(e.to_string())
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if (200..300).contains(&status) => {
                warn!("读取 {} 创建响应失败: {}", kind, e);
                return Ok(CreateResult::UnknownOutcome);
            }
            Err(e) => return Err(e.into()),
        };

        let result = decode_create_response(status, content_type.as_deref(), &body);
        debug!("提交 {} → HTTP {} → {:?}", kind, status, result);
        Ok(result)
    }
}

/// 子记录提交时父级必须已经有服务端 ID
fn require_server_parent(parent: &ParentRef) -> Result<i64> {
    parent.server_id().ok_or_else(|| {
        SyncSdkError::InvalidArgument("父级稽核尚未同步，不能提交子记录".to_string())
    })
}

/// 文章、稽核的 JSON 请求体
fn json_body(payload: &RecordPayload) -> Result<Value> {
    match payload {
        RecordPayload::Article { title, content } => Ok(json!({ "title": title, "content": content })),
        RecordPayload::Audit { title, site, auditor, category_id, scheduled_for } => {
            let mut body = Map::new();
            body.insert("title".into(), json!(title));
            if let Some(site) = site {
                body.insert("site".into(), json!(site));
            }
            if let Some(auditor) = auditor {
                body.insert("auditor".into(), json!(auditor));
            }
            if let Some(category_id) = category_id {
                body.insert("category_id".into(), json!(category_id));
            }
            if let Some(date) = scheduled_for {
                body.insert("scheduled_for".into(), json!(date));
            }
            Ok(Value::Object(body))
        }
        other => Err(SyncSdkError::InvalidArgument(format!("{} 不能通过 create 提交", other.kind()))),
    }
}

/// 评估的表单字段
fn evaluation_form(payload: &RecordPayload) -> Result<Vec<(&'static str, String)>> {
    match payload {
        RecordPayload::Evaluation { audit, point_id, answer, score, comment } => {
            let mut form = vec![
                ("audit_id", require_server_parent(audit)?.to_string()),
                ("point_id", point_id.to_string()),
                ("answer", answer.clone()),
            ];
            if let Some(score) = score {
                form.push(("score", score.to_string()));
            }
            if let Some(comment) = comment {
                form.push(("comment", comment.clone()));
            }
            Ok(form)
        }
        other => Err(SyncSdkError::InvalidArgument(format!("{} 不是评估", other.kind()))),
    }
}

/// 文档的 multipart 表单
fn document_form(payload: &RecordPayload) -> Result<multipart::Form> {
    match payload {
        RecordPayload::Document { audit, point_id, filename, mime_type, checksum, bytes } => {
            let part = multipart::Part::bytes(bytes.to_vec())
                .file_name(filename.clone())
                .mime_str(mime_type)
                .map_err(|e| SyncSdkError::InvalidArgument(format!("无效的 MIME 类型 {}: {}", mime_type, e)))?;

            let mut form = multipart::Form::new()
                .text("audit_id", require_server_parent(audit)?.to_string())
                .text("checksum", checksum.clone())
                .part("file", part);
            if let Some(point_id) = point_id {
                form = form.text("point_id", point_id.to_string());
            }
            Ok(form)
        }
        other => Err(SyncSdkError::InvalidArgument(format!("{} 不是文档", other.kind()))),
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create(&self, kind: EntityKind, payload: &RecordPayload) -> Result<CreateResult> {
        let body = json_body(payload)?;
        let request = self.client.post(self.url(kind)).json(&body);
        self.send_create(request, kind).await
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>> {
        let response = self
            .client
            .get(self.url(kind))
            .send()
            .await
            .map_err(|e| SyncSdkError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(if status.as_u16() >= 500 {
                SyncSdkError::Transient(status.as_u16())
            } else {
                SyncSdkError::Malformed(format!("获取 {} 列表失败: HTTP {}", kind, status))
            });
        }

        let body = response.text().await?;
        decode_list_response(&body)
            .map_err(|reason| SyncSdkError::Malformed(format!("{} 列表: {}", kind, reason)))
    }

    async fn update_evaluation(&self, payload: &RecordPayload) -> Result<CreateResult> {
        let form = evaluation_form(payload)?;
        let request = self.client.post(self.url(EntityKind::Evaluation)).form(&form);
        self.send_create(request, EntityKind::Evaluation).await
    }

    async fn add_document(&self, payload: &RecordPayload) -> Result<CreateResult> {
        let form = document_form(payload)?;
        let request = self.client.post(self.url(EntityKind::Document)).multipart(form);
        self.send_create(request, EntityKind::Document).await
    }
}
