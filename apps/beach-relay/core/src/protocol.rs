//! JSON signaling protocol carried over text WebSocket frames.
//!
//! Every client frame is a request with a caller-chosen `id`; the server answers
//! each with exactly one `response` frame echoing that id. Notifications flow
//! server → client only and are never acknowledged.
//!
//! ```json
//! {"type":"request","id":3,"method":"produce","data":{"transportId":"…","kind":"video","rtpParameters":{…}}}
//! {"type":"response","id":3,"result":{"ok":{"id":"…"}}}
//! {"type":"notification","method":"newProducer","data":{"producerId":"…","kind":"video"}}
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    ConsumerId, ConsumerType, DtlsParameters, ErrorPayload, IceCandidate, IceParameters,
    MediaKind, PeerId, ProducerId, RoomId, RtpCapabilities, RtpParameters, TransportId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Join,
    GetRouterRtpCapabilities,
    CreateProducerTransport,
    CreateConsumerTransport,
    ConnectProducerTransport,
    ConnectConsumerTransport,
    Produce,
    Consume,
    Resume,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Join => "join",
            Method::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Method::CreateProducerTransport => "createProducerTransport",
            Method::CreateConsumerTransport => "createConsumerTransport",
            Method::ConnectProducerTransport => "connectProducerTransport",
            Method::ConnectConsumerTransport => "connectConsumerTransport",
            Method::Produce => "produce",
            Method::Consume => "consume",
            Method::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationMethod {
    Joined,
    NewProducer,
    ProducerClosed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid payload for {method}: {source}")]
    InvalidPayload {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A typed request and the acknowledgement payload it expects.
pub trait SignalRequest: Serialize {
    const METHOD: Method;
    type Response: Serialize + DeserializeOwned;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub peer_id: PeerId,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetRouterRtpCapabilitiesRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProducerTransportRequest {
    #[serde(default)]
    pub force_tcp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtp_capabilities: Option<RtpCapabilities>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConsumerTransportRequest {
    #[serde(default)]
    pub force_tcp: bool,
}

/// Connection parameters of a freshly created transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectProducerTransportRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<TransportId>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectConsumerTransportRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<TransportId>,
    pub dtls_parameters: DtlsParameters,
}

/// Acknowledgement without a payload; encoded as `{}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<TransportId>,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    /// True while media from the producer is held back from this consumer,
    /// either because the consumer starts paused or the producer is paused.
    pub producer_paused: bool,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<ConsumerId>,
}

impl SignalRequest for JoinRequest {
    const METHOD: Method = Method::Join;
    type Response = JoinResponse;
}

impl SignalRequest for GetRouterRtpCapabilitiesRequest {
    const METHOD: Method = Method::GetRouterRtpCapabilities;
    type Response = RtpCapabilities;
}

impl SignalRequest for CreateProducerTransportRequest {
    const METHOD: Method = Method::CreateProducerTransport;
    type Response = TransportParameters;
}

impl SignalRequest for CreateConsumerTransportRequest {
    const METHOD: Method = Method::CreateConsumerTransport;
    type Response = TransportParameters;
}

impl SignalRequest for ConnectProducerTransportRequest {
    const METHOD: Method = Method::ConnectProducerTransport;
    type Response = Empty;
}

impl SignalRequest for ConnectConsumerTransportRequest {
    const METHOD: Method = Method::ConnectConsumerTransport;
    type Response = Empty;
}

impl SignalRequest for ProduceRequest {
    const METHOD: Method = Method::Produce;
    type Response = ProduceResponse;
}

impl SignalRequest for ConsumeRequest {
    const METHOD: Method = Method::Consume;
    type Response = ConsumeResponse;
}

impl SignalRequest for ResumeRequest {
    const METHOD: Method = Method::Resume;
    type Response = Empty;
}

/// Decoded form of any client request, as dispatched by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Join(JoinRequest),
    GetRouterRtpCapabilities,
    CreateProducerTransport(CreateProducerTransportRequest),
    CreateConsumerTransport(CreateConsumerTransportRequest),
    ConnectProducerTransport(ConnectProducerTransportRequest),
    ConnectConsumerTransport(ConnectConsumerTransportRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    Resume(ResumeRequest),
}

impl Request {
    pub fn decode(method: Method, data: Value) -> Result<Self, ProtocolError> {
        let data = normalize_payload(data);
        let request = match method {
            Method::Join => Request::Join(payload(method, data)?),
            Method::GetRouterRtpCapabilities => Request::GetRouterRtpCapabilities,
            Method::CreateProducerTransport => {
                Request::CreateProducerTransport(payload(method, data)?)
            }
            Method::CreateConsumerTransport => {
                Request::CreateConsumerTransport(payload(method, data)?)
            }
            Method::ConnectProducerTransport => {
                Request::ConnectProducerTransport(payload(method, data)?)
            }
            Method::ConnectConsumerTransport => {
                Request::ConnectConsumerTransport(payload(method, data)?)
            }
            Method::Produce => Request::Produce(payload(method, data)?),
            Method::Consume => Request::Consume(payload(method, data)?),
            Method::Resume => Request::Resume(payload(method, data)?),
        };
        Ok(request)
    }

    pub fn method(&self) -> Method {
        match self {
            Request::Join(_) => Method::Join,
            Request::GetRouterRtpCapabilities => Method::GetRouterRtpCapabilities,
            Request::CreateProducerTransport(_) => Method::CreateProducerTransport,
            Request::CreateConsumerTransport(_) => Method::CreateConsumerTransport,
            Request::ConnectProducerTransport(_) => Method::ConnectProducerTransport,
            Request::ConnectConsumerTransport(_) => Method::ConnectConsumerTransport,
            Request::Produce(_) => Method::Produce,
            Request::Consume(_) => Method::Consume,
            Request::Resume(_) => Method::Resume,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedNotification {
    pub peer_id: PeerId,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducerNotification {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedNotification {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Joined(JoinedNotification),
    NewProducer(NewProducerNotification),
    ProducerClosed(ProducerClosedNotification),
}

impl Notification {
    pub fn method(&self) -> NotificationMethod {
        match self {
            Notification::Joined(_) => NotificationMethod::Joined,
            Notification::NewProducer(_) => NotificationMethod::NewProducer,
            Notification::ProducerClosed(_) => NotificationMethod::ProducerClosed,
        }
    }

    pub fn decode(method: NotificationMethod, data: Value) -> Result<Self, ProtocolError> {
        let data = normalize_payload(data);
        let label = notification_label(method);
        let parse = |source| ProtocolError::InvalidPayload {
            method: label,
            source,
        };
        Ok(match method {
            NotificationMethod::Joined => {
                Notification::Joined(serde_json::from_value(data).map_err(parse)?)
            }
            NotificationMethod::NewProducer => {
                Notification::NewProducer(serde_json::from_value(data).map_err(parse)?)
            }
            NotificationMethod::ProducerClosed => {
                Notification::ProducerClosed(serde_json::from_value(data).map_err(parse)?)
            }
        })
    }

    pub fn into_frame(self) -> Result<ServerFrame, serde_json::Error> {
        let method = self.method();
        let data = match self {
            Notification::Joined(inner) => serde_json::to_value(inner)?,
            Notification::NewProducer(inner) => serde_json::to_value(inner)?,
            Notification::ProducerClosed(inner) => serde_json::to_value(inner)?,
        };
        Ok(ServerFrame::Notification { method, data })
    }
}

/// Outcome of a request: exactly one of these is sent per request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckResult {
    Ok(Value),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Request {
        id: u64,
        method: Method,
        #[serde(default)]
        data: Value,
    },
}

impl ClientFrame {
    pub fn request<R: SignalRequest>(id: u64, request: &R) -> Result<Self, serde_json::Error> {
        Ok(ClientFrame::Request {
            id,
            method: R::METHOD,
            data: serde_json::to_value(request)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        id: u64,
        result: AckResult,
    },
    Notification {
        method: NotificationMethod,
        #[serde(default)]
        data: Value,
    },
}

impl ServerFrame {
    pub fn ok(id: u64, data: Value) -> Self {
        ServerFrame::Response {
            id,
            result: AckResult::Ok(data),
        }
    }

    pub fn error(id: u64, error: ErrorPayload) -> Self {
        ServerFrame::Response {
            id,
            result: AckResult::Error(error),
        }
    }
}

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Malformed)
}

fn normalize_payload(data: Value) -> Value {
    match data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

fn payload<T: DeserializeOwned>(method: Method, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        method: method.as_str(),
        source,
    })
}

fn notification_label(method: NotificationMethod) -> &'static str {
    match method {
        NotificationMethod::Joined => "joined",
        NotificationMethod::NewProducer => "newProducer",
        NotificationMethod::ProducerClosed => "producerClosed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DtlsFingerprint, DtlsRole, ErrorCode};
    use serde_json::json;

    #[test_timeout::timeout]
    fn method_names_match_wire_format() {
        for method in [
            Method::GetRouterRtpCapabilities,
            Method::CreateProducerTransport,
            Method::ConnectConsumerTransport,
            Method::Resume,
        ] {
            let wire = serde_json::to_value(method).unwrap();
            assert_eq!(wire.as_str(), Some(method.as_str()));
        }
    }

    #[test_timeout::timeout]
    fn request_without_data_decodes_as_empty_payload() {
        let frame: ClientFrame =
            decode_frame(r#"{"type":"request","id":1,"method":"resume"}"#).unwrap();
        let ClientFrame::Request { id, method, data } = frame;
        assert_eq!(id, 1);
        let request = Request::decode(method, data).unwrap();
        assert_eq!(request, Request::Resume(ResumeRequest::default()));
        assert_eq!(request.method(), Method::Resume);
    }

    #[test_timeout::timeout]
    fn connect_request_carries_dtls_parameters() {
        let data = json!({
            "dtlsParameters": {
                "role": "client",
                "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB" }]
            }
        });
        let request = Request::decode(Method::ConnectProducerTransport, data).unwrap();
        let Request::ConnectProducerTransport(inner) = request else {
            panic!("unexpected request {request:?}");
        };
        assert_eq!(inner.transport_id, None);
        assert_eq!(inner.dtls_parameters.role, DtlsRole::Client);
        assert_eq!(
            inner.dtls_parameters.fingerprints,
            vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: "AA:BB".into()
            }]
        );
    }

    #[test_timeout::timeout]
    fn produce_request_missing_kind_is_rejected() {
        let err = Request::decode(
            Method::Produce,
            json!({ "transportId": "t1", "rtpParameters": { "codecs": [] } }),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { method: "produce", .. }));
    }

    #[test_timeout::timeout]
    fn error_ack_is_structured() {
        let frame = ServerFrame::error(
            9,
            ErrorPayload::new(ErrorCode::DuplicateFinalize, "transport already finalized"),
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "response",
                "id": 9,
                "result": { "error": { "code": "duplicate_finalize", "message": "transport already finalized" } }
            })
        );
    }

    #[test_timeout::timeout]
    fn notification_frame_uses_method_and_data() {
        let frame = Notification::NewProducer(NewProducerNotification {
            producer_id: ProducerId::from("p1"),
            kind: MediaKind::Video,
        })
        .into_frame()
        .unwrap();
        let text = encode_frame(&frame).unwrap();
        let parsed: ServerFrame = decode_frame(&text).unwrap();
        let ServerFrame::Notification { method, data } = parsed else {
            panic!("expected notification");
        };
        assert_eq!(method, NotificationMethod::NewProducer);
        assert_eq!(data, json!({ "producerId": "p1", "kind": "video" }));
    }

    #[test_timeout::timeout]
    fn consume_response_exposes_type_field() {
        let response = ConsumeResponse {
            producer_id: ProducerId::from("p1"),
            id: ConsumerId::from("c1"),
            kind: MediaKind::Video,
            rtp_parameters: RtpParameters::default(),
            consumer_type: ConsumerType::Simulcast,
            producer_paused: true,
            paused: true,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "simulcast");
        assert_eq!(value["producerPaused"], true);
        assert_eq!(value["producerId"], "p1");
    }
}
