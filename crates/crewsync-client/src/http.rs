//! reqwest implementation of the collaborator services.
//!
//! Routes, relative to `api_url`:
//!
//! | call                   | route                            |
//! |------------------------|----------------------------------|
//! | current permissions    | `GET /permissions/{role}`        |
//! | post message           | `POST /rooms/{id}/messages`      |
//! | history                | `GET /rooms/{id}/messages`       |
//! | mark room read         | `PUT /rooms/{id}/read`           |
//! | list rooms             | `GET /rooms`                     |
//! | create direct room     | `POST /rooms/direct`             |
//! | list notifications     | `GET /notifications`             |
//! | mark one read          | `PATCH /notifications/{id}/read` |
//! | mark all read          | `PATCH /notifications/read-all`  |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crewsync_shared::{
    Message, NotificationEvent, NotificationId, OutgoingMessage, PermissionSet, Role, Room,
    RoomId, UserId,
};

use crate::error::ServiceError;
use crate::services::{
    AuthorizationService, BearerToken, MessageService, NotificationService, RoomService,
};

pub struct HttpBackend {
    client: Client,
    base_url: Url,
    bearer: Arc<BearerToken>,
}

#[derive(Deserialize)]
struct PermissionsResponse {
    permissions: PermissionSet,
}

#[derive(Serialize)]
struct DirectRoomRequest<'a> {
    target_user_id: &'a UserId,
}

#[derive(Serialize)]
struct MarkAllRequest {
    before: DateTime<Utc>,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration, bearer: Arc<BearerToken>) -> Result<Self, ServiceError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ServiceError::Network(format!("invalid API URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ServiceError::Network(format!("API URL {base_url} cannot take a path")));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            bearer,
        })
    }

    /// Append `segments` to the API URL. Each segment is percent-encoded,
    /// so ids containing `/`, `?` or spaces stay a single segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // checked in `new`: the base URL always has a path
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.endpoint(segments);
        debug!(%method, %url, "service call");
        let builder = self.client.request(method, url);
        match self.bearer.get() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ServiceError> {
        let response = builder.send().await.map_err(map_reqwest)?;
        check_status(response.status())?;
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ServiceError> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }
}

fn map_reqwest(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout
    } else if let Some(status) = err.status() {
        status_error(status)
    } else {
        ServiceError::Network(err.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), ServiceError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(status_error(status))
    }
}

fn status_error(status: StatusCode) -> ServiceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceError::Timeout,
        other => ServiceError::Status(other.as_u16()),
    }
}

#[async_trait]
impl AuthorizationService for HttpBackend {
    async fn current_permissions(&self, role: Role) -> Result<PermissionSet, ServiceError> {
        let response: PermissionsResponse = self
            .json(self.request(Method::GET, &["permissions", role.as_str()]))
            .await?;
        Ok(response.permissions)
    }
}

#[async_trait]
impl MessageService for HttpBackend {
    async fn post_message(
        &self,
        room_id: &RoomId,
        message: &OutgoingMessage,
    ) -> Result<Message, ServiceError> {
        let path = ["rooms", room_id.as_str(), "messages"];
        self.json(self.request(Method::POST, &path).json(message)).await
    }

    async fn history(&self, room_id: &RoomId) -> Result<Vec<Message>, ServiceError> {
        self.json(self.request(Method::GET, &["rooms", room_id.as_str(), "messages"]))
            .await
    }

    async fn mark_room_read(&self, room_id: &RoomId) -> Result<(), ServiceError> {
        self.send(self.request(Method::PUT, &["rooms", room_id.as_str(), "read"]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RoomService for HttpBackend {
    async fn rooms(&self) -> Result<Vec<Room>, ServiceError> {
        self.json(self.request(Method::GET, &["rooms"])).await
    }

    async fn create_direct(&self, target: &UserId) -> Result<Room, ServiceError> {
        let body = DirectRoomRequest {
            target_user_id: target,
        };
        self.json(self.request(Method::POST, &["rooms", "direct"]).json(&body))
            .await
    }
}

#[async_trait]
impl NotificationService for HttpBackend {
    async fn notifications(&self) -> Result<Vec<NotificationEvent>, ServiceError> {
        self.json(self.request(Method::GET, &["notifications"])).await
    }

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), ServiceError> {
        self.send(self.request(Method::PATCH, &["notifications", id.as_str(), "read"]))
            .await?;
        Ok(())
    }

    async fn mark_all_read(&self, before: DateTime<Utc>) -> Result<(), ServiceError> {
        let body = MarkAllRequest { before };
        self.send(self.request(Method::PATCH, &["notifications", "read-all"]).json(&body))
            .await?;
        Ok(())
    }
}
