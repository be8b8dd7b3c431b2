//! DNS-over-HTTPS responder for the gateway's own zone
//!
//! Every name (except the `.google.com.` exemption) resolves to the
//! gateway itself: A and AAAA answers carry the configured addresses, and
//! HTTPS answers advertise `h2` plus the gateway's ECH configuration.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Header, Message};
use hickory_proto::rr::rdata::svcb::{Alpn, EchConfig, IpHint, SvcParamKey, SvcParamValue, SVCB};
use hickory_proto::rr::rdata::{A, AAAA, HTTPS};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use thiserror::Error;
use tracing::{error, info};

use crate::mux::{text_response, Handler, ResponseBody};

pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Names under this suffix get no synthetic answers.
const EXEMPT_SUFFIX: &str = ".google.com.";
const ANSWER_TTL: u32 = 300;
const MAX_DNS_MESSAGE_LEN: usize = 65535;

/// Why a DoH request got no DNS answer.
#[derive(Error, Debug)]
pub enum DohRejection {
    #[error("Missing 'dns' query parameter")]
    MissingParameter,

    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid Content-Type")]
    UnsupportedMediaType,

    #[error("Failed to read request body")]
    BodyRead,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Failed to parse DNS query")]
    MalformedQuery,

    #[error("Empty DNS question")]
    EmptyQuestion,

    #[error("Failed to pack DNS response")]
    Pack(#[source] ProtoError),
}

impl DohRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            DohRejection::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DohRejection::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DohRejection::Pack(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DohRejection::MissingParameter
            | DohRejection::InvalidBase64
            | DohRejection::BodyRead
            | DohRejection::MalformedQuery
            | DohRejection::EmptyQuestion => StatusCode::BAD_REQUEST,
        }
    }
}

/// What the gateway publishes about itself.
#[derive(Debug, Clone)]
pub struct AnswerSet {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    /// ECHConfigList, length prefix included.
    pub ech_config_list: Vec<u8>,
}

impl AnswerSet {
    /// Synthetic answers for one question.
    pub fn records(&self, name: &Name, query_type: RecordType) -> Vec<Record> {
        if name.to_ascii().ends_with(EXEMPT_SUFFIX) {
            return Vec::new();
        }

        let rdata = match query_type {
            RecordType::A => RData::A(A(self.ipv4)),
            RecordType::AAAA => RData::AAAA(AAAA(self.ipv6)),
            RecordType::HTTPS => RData::HTTPS(HTTPS(self.service_binding())),
            _ => return Vec::new(),
        };
        vec![Record::from_rdata(name.clone(), ANSWER_TTL, rdata)]
    }

    fn service_binding(&self) -> SVCB {
        SVCB::new(
            1,
            Name::root(),
            vec![
                (
                    SvcParamKey::Alpn,
                    SvcParamValue::Alpn(Alpn(vec!["h2".to_string()])),
                ),
                (
                    SvcParamKey::EchConfig,
                    SvcParamValue::EchConfig(EchConfig(self.ech_config_list.clone())),
                ),
                (
                    SvcParamKey::Ipv4Hint,
                    SvcParamValue::Ipv4Hint(IpHint(vec![A(self.ipv4)])),
                ),
                (
                    SvcParamKey::Ipv6Hint,
                    SvcParamValue::Ipv6Hint(IpHint(vec![AAAA(self.ipv6)])),
                ),
            ],
        )
    }
}

/// Answer the first question of a wire-format DNS query.
pub fn build_response(query: &[u8], answers: &AnswerSet) -> Result<Vec<u8>, DohRejection> {
    let request = Message::from_vec(query).map_err(|_| DohRejection::MalformedQuery)?;
    let question = request
        .queries()
        .first()
        .ok_or(DohRejection::EmptyQuestion)?;

    info!(
        "Received query for {}, type {}",
        question.name(),
        question.query_type()
    );

    let mut response = Message::new();
    response.set_header(Header::response_from_request(request.header()));
    response.add_query(question.clone());
    response.add_answers(answers.records(question.name(), question.query_type()));
    response.to_vec().map_err(DohRejection::Pack)
}

/// HTTP handler for `GET ?dns=` and `POST application/dns-message`.
#[derive(Debug, Clone)]
pub struct DohResponder {
    answers: Arc<AnswerSet>,
}

impl DohResponder {
    pub fn new(answers: AnswerSet) -> Self {
        Self {
            answers: Arc::new(answers),
        }
    }

    pub async fn respond<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.answer(req).await {
            Ok(message) => {
                let mut response = Response::new(Full::new(Bytes::from(message)));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static(DNS_MESSAGE_CONTENT_TYPE),
                );
                response
            }
            Err(rejection) => {
                if let DohRejection::Pack(e) = &rejection {
                    error!("Error packing response: {}", e);
                }
                text_response(rejection.status(), &rejection.to_string())
            }
        }
    }

    async fn answer<B>(&self, req: Request<B>) -> Result<Vec<u8>, DohRejection>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let query = match *req.method() {
            Method::GET => {
                let encoded = req
                    .uri()
                    .query()
                    .and_then(|q| {
                        form_urlencoded::parse(q.as_bytes())
                            .find(|(key, _)| key == "dns")
                            .map(|(_, value)| value.into_owned())
                    })
                    .filter(|value| !value.is_empty())
                    .ok_or(DohRejection::MissingParameter)?;
                URL_SAFE_NO_PAD
                    .decode(encoded)
                    .map_err(|_| DohRejection::InvalidBase64)?
            }
            Method::POST => {
                let is_dns_message = req
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    == Some(DNS_MESSAGE_CONTENT_TYPE);
                if !is_dns_message {
                    return Err(DohRejection::UnsupportedMediaType);
                }
                Limited::new(req.into_body(), MAX_DNS_MESSAGE_LEN)
                    .collect()
                    .await
                    .map_err(|_| DohRejection::BodyRead)?
                    .to_bytes()
                    .to_vec()
            }
            _ => return Err(DohRejection::MethodNotAllowed),
        };

        build_response(&query, &self.answers)
    }
}

impl Handler for DohResponder {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, Response<ResponseBody>> {
        let responder = self.clone();
        Box::pin(async move { responder.respond(req).await })
    }
}
