//! Matrix client-server API transport over reqwest.
//!
//! One request per call, no retries. Authenticated endpoints send the access
//! token as a bearer header; 401 and 403 map to
//! [`TransportError::Unauthorized`], every other non-success status to
//! [`TransportError::Status`].

use herald_core::{Credentials, Transport, TransportError};
use herald_proto::{
    ClaimResponse, DeviceKeysResponse, OneTimeKeyClaim, RoomId, ToDeviceMessages, UserId,
    keys::{
        KeysClaimRequest, KeysClaimResponse, KeysQueryRequest, KeysQueryResponse,
        KeysUploadRequest, KeysUploadResponse,
    },
};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned, de::IgnoredAny};
use tokio::sync::RwLock;

use crate::error::ClientError;

const API_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];

/// Homeserver transport over HTTPS.
pub struct HttpTransport {
    client: Client,
    base: Url,
    access_token: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Unauthenticated transport for `server` (a host or a base URL).
    ///
    /// A bare host is reached over HTTPS.
    pub fn new(server: &str) -> Result<Self, ClientError> {
        let invalid = |reason: String| ClientError::InvalidServer { server: server.to_string(), reason };

        let raw = if server.contains("://") {
            server.to_string()
        } else {
            format!("https://{server}")
        };
        let base = Url::parse(&raw).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }

        let client = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self { client, base, access_token: RwLock::new(None) })
    }

    /// Transport authenticated with stored credentials.
    pub fn with_credentials(server: &str, credentials: &Credentials) -> Result<Self, ClientError> {
        let transport = Self::new(server)?;
        Ok(Self { access_token: RwLock::new(Some(credentials.access_token.clone())), ..transport })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(API_PREFIX).extend(segments);
        }
        url
    }

    async fn call<R: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        authenticated: bool,
    ) -> Result<R, TransportError> {
        let request = if authenticated {
            let token = self.access_token.read().await.clone().ok_or(TransportError::MissingToken)?;
            request.bearer_auth(token)
        } else {
            request
        };

        let response = request.send().await.map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            return response.json::<R>().await.map_err(|e| TransportError::InvalidResponse(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(error_for(status, &body))
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
        authenticated: bool,
    ) -> Result<R, TransportError> {
        let request = self.client.request(Method::POST, self.url(segments)).json(body);
        self.call(request, authenticated).await
    }

    async fn put<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<R, TransportError> {
        let request = self.client.request(Method::PUT, self.url(segments)).json(body);
        self.call(request, true).await
    }

    async fn store_token(&self, credentials: &Credentials) {
        *self.access_token.write().await = Some(credentials.access_token.clone());
    }
}

/// Matrix error body (`{"errcode", "error"}`), plus the interactive-auth
/// session when the server asks for another auth stage.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    errcode: Option<String>,
    error: Option<String>,
    session: Option<String>,
    flows: Option<IgnoredAny>,
}

fn error_for(status: StatusCode, body: &str) -> TransportError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();

    if status == StatusCode::UNAUTHORIZED && parsed.flows.is_some() {
        if let Some(session) = parsed.session {
            return TransportError::AuthRequired { session };
        }
    }

    let message = match (parsed.errcode, parsed.error) {
        (Some(code), Some(error)) => format!("{code}: {error}"),
        (Some(code), None) => code,
        (None, Some(error)) => error,
        (None, None) => body.to_string(),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::Unauthorized { status: status.as_u16(), message }
        },
        _ => TransportError::Status { status: status.as_u16(), message },
    }
}

#[derive(Serialize)]
struct UserIdentifier<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    user: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    identifier: UserIdentifier<'a>,
    password: &'a str,
}

#[derive(Serialize)]
struct AuthData<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    session: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    password: &'a str,
    initial_device_display_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<AuthData<'a>>,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Deserialize)]
struct JoinResponse {
    room_id: RoomId,
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(default)]
    chunk: Vec<MemberEvent>,
}

#[derive(Deserialize)]
struct MemberEvent {
    state_key: UserId,
    content: MemberContent,
}

#[derive(Deserialize)]
struct MemberContent {
    membership: String,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: String,
}

impl Transport for HttpTransport {
    async fn login(&self, user: &str, password: &str) -> Result<Credentials, TransportError> {
        let body = LoginRequest {
            kind: "m.login.password",
            identifier: UserIdentifier { kind: "m.id.user", user },
            password,
        };

        let credentials: Credentials = self.post(&["login"], &body, false).await?;
        self.store_token(&credentials).await;
        Ok(credentials)
    }

    async fn register(
        &self,
        user: &str,
        password: &str,
        auth_session: Option<&str>,
    ) -> Result<Credentials, TransportError> {
        let body = RegisterRequest {
            username: user,
            password,
            initial_device_display_name: user,
            auth: auth_session.map(|session| AuthData { kind: "m.login.dummy", session }),
        };

        let credentials: Credentials = self.post(&["register"], &body, false).await?;
        self.store_token(&credentials).await;
        Ok(credentials)
    }

    async fn logout(&self) -> Result<(), TransportError> {
        let _: IgnoredAny = self.post(&["logout"], &Empty {}, true).await?;
        *self.access_token.write().await = None;
        Ok(())
    }

    async fn logout_all(&self) -> Result<(), TransportError> {
        let _: IgnoredAny = self.post(&["logout", "all"], &Empty {}, true).await?;
        *self.access_token.write().await = None;
        Ok(())
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<RoomId, TransportError> {
        let response: JoinResponse = self.post(&["join", room_id.as_str()], &Empty {}, true).await?;
        Ok(response.room_id)
    }

    async fn room_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, TransportError> {
        let mut url = self.url(&["rooms", room_id.as_str(), "members"]);
        url.query_pairs_mut().append_pair("membership", "join");

        let response: MembersResponse = self.call(self.client.get(url), true).await?;
        Ok(response
            .chunk
            .into_iter()
            .filter(|member| member.content.membership == "join")
            .map(|member| member.state_key)
            .collect())
    }

    async fn query_device_keys(
        &self,
        users: &[UserId],
    ) -> Result<DeviceKeysResponse, TransportError> {
        let body = KeysQueryRequest {
            device_keys: users.iter().map(|user| (user.clone(), Vec::new())).collect(),
        };

        let response: KeysQueryResponse = self.post(&["keys", "query"], &body, true).await?;
        Ok(response.device_keys)
    }

    async fn claim_one_time_keys(
        &self,
        claim: &OneTimeKeyClaim,
    ) -> Result<ClaimResponse, TransportError> {
        let body = KeysClaimRequest { one_time_keys: claim.clone() };

        let response: KeysClaimResponse = self.post(&["keys", "claim"], &body, true).await?;
        response.into_claimed().map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    async fn upload_keys(
        &self,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError> {
        self.post(&["keys", "upload"], request, true).await
    }

    async fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &str,
        content: &serde_json::Value,
    ) -> Result<String, TransportError> {
        let response: SendResponse =
            self.put(&["rooms", room_id.as_str(), "send", event_type, txn_id], content).await?;
        Ok(response.event_id)
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        messages: &ToDeviceMessages,
    ) -> Result<(), TransportError> {
        let _: IgnoredAny = self.put(&["sendToDevice", event_type, txn_id], messages).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_uses_https() {
        let transport = HttpTransport::new("matrix.example.org").unwrap();

        assert_eq!(
            transport.url(&["login"]).as_str(),
            "https://matrix.example.org/_matrix/client/v3/login"
        );
    }

    #[test]
    fn path_segments_are_escaped() {
        let transport = HttpTransport::new("http://localhost:8008/").unwrap();
        let url = transport.url(&["rooms", "!abc:x", "send", "m.room.message", "txn/1"]);

        assert_eq!(
            url.as_str(),
            "http://localhost:8008/_matrix/client/v3/rooms/!abc:x/send/m.room.message/txn%2F1"
        );
    }

    #[test]
    fn interactive_auth_challenge_is_auth_required() {
        let body = r#"{"flows":[{"stages":["m.login.dummy"]}],"session":"xyz","params":{}}"#;

        assert_eq!(
            error_for(StatusCode::UNAUTHORIZED, body),
            TransportError::AuthRequired { session: "xyz".into() }
        );
    }

    #[test]
    fn forbidden_is_unauthorized() {
        let body = r#"{"errcode":"M_FORBIDDEN","error":"Invalid password"}"#;

        assert_eq!(
            error_for(StatusCode::FORBIDDEN, body),
            TransportError::Unauthorized {
                status: 403,
                message: "M_FORBIDDEN: Invalid password".into()
            }
        );
    }

    #[test]
    fn other_failures_keep_status_and_raw_body() {
        assert_eq!(
            error_for(StatusCode::BAD_GATEWAY, "upstream down"),
            TransportError::Status { status: 502, message: "upstream down".into() }
        );
    }

    #[test]
    fn login_body_shape() {
        let body = LoginRequest {
            kind: "m.login.password",
            identifier: UserIdentifier { kind: "m.id.user", user: "bot" },
            password: "pw",
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "type": "m.login.password",
                "identifier": {"type": "m.id.user", "user": "bot"},
                "password": "pw",
            })
        );
    }

    #[tokio::test]
    async fn authenticated_call_without_token_fails_before_sending() {
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();

        let result = transport.room_members(&RoomId::new("!abc:x")).await;
        assert_eq!(result, Err(TransportError::MissingToken));
    }
}
