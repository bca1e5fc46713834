//! Redfish management requests: firmware upload and TLS certificate provisioning.

use futures::Stream;
use reqwest::header::{CONNECTION, HOST, HeaderValue};
use reqwest::{Method, RequestBuilder, Url};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt as _;
use tracing::{debug, info};

const UPLOAD_CHUNK: usize = 64 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "redfish::Args")]
pub struct Args {
    /// Base URL of the management controller.
    #[arg(long, short = 's', default_value = "http://127.0.0.1:8080")]
    server: Url,

    #[arg(long, short = 'u', default_value = "admin")]
    username: String,

    #[arg(long, default_value = "admin123")]
    password: String,

    /// Send this `Host` header instead of the one derived from `--server`.
    #[arg(long)]
    host: Option<String>,

    /// Connect to this address instead of resolving the `--server` host name.
    ///
    /// The host name is still used for SNI and certificate verification.
    #[arg(long)]
    connect_to: Option<SocketAddr>,

    /// Do not verify the server's TLS certificate.
    #[arg(long, short = 'k', conflicts_with = "ca_cert")]
    insecure: bool,

    /// Trust server certificates issued by this PEM encoded CA.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// PEM encoded client certificate for mutual TLS.
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// PEM encoded private key of `--client-cert`, if it is not in the same file.
    #[arg(long, requires = "client_cert")]
    client_key: Option<PathBuf>,

    #[arg(long, default_value = "5s")]
    connect_timeout: humantime::Duration,

    /// Overall time limit of a request, including the upload.
    #[arg(long, default_value = "300s")]
    timeout: humantime::Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not set up the HTTP client")]
    CreateClient(#[source] reqwest::Error),
    #[error("{0} cannot be used as a base URL")]
    CannotBeABase(Url),
    #[error("{0} does not name a host to connect to")]
    NoHost(Url),
    #[error("{1:?} does not contain a usable PEM certificate")]
    Certificate(#[source] reqwest::Error, PathBuf),
    #[error("the client certificate and key are not a usable PEM identity")]
    Identity(#[source] reqwest::Error),
    #[error("{0:?} is not a valid Host header value")]
    InvalidHost(String, #[source] reqwest::header::InvalidHeaderValue),
    #[error("could not open {1:?}")]
    OpenFile(#[source] std::io::Error, PathBuf),
    #[error("{0:?} does not name a file")]
    NoFileName(PathBuf),
    #[error("could not build the multipart form")]
    BuildForm(#[source] reqwest::Error),
    #[error("{0} {1} failed")]
    Request(Method, Url, #[source] reqwest::Error),
    #[error("server responded with {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
    #[error("response to {0} is not valid JSON")]
    DecodeJson(Url, #[source] serde_json::Error),
    #[error("response does not contain a `CSRString`")]
    MissingCsr,
}

/// The status line and body of a successful request.
#[derive(Debug)]
pub struct Reply {
    pub status: reqwest::StatusCode,
    pub body: String,
}

impl Reply {
    /// The body pretty-printed when it is JSON, as-is otherwise.
    pub fn pretty_body(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or_else(|| self.body.clone())
    }
}

/// Fields of a `CertificateService.GenerateCSR` request.
#[derive(clap::Parser, Clone, Debug)]
#[group(id = "redfish::CsrArgs")]
pub struct CsrArgs {
    #[arg(long, default_value = "/redfish/v1/Managers/Kenmec/NetworkProtocol/HTTPS/Certificates")]
    certificate_collection: String,
    #[arg(long, default_value = "TW")]
    country: String,
    #[arg(long, default_value = "Taipei")]
    state: String,
    #[arg(long, default_value = "Taipei")]
    city: String,
    #[arg(long, default_value = "Dexatek")]
    organization: String,
    #[arg(long, default_value = "IT Department")]
    organizational_unit: String,
    #[arg(long, default_value = "Dexatek.local")]
    common_name: String,
    /// Subject alternative names, may be repeated.
    #[arg(long = "alternative-name", default_values = ["Dexatek.local", "127.0.0.1"])]
    alternative_names: Vec<String>,
    #[arg(
        long = "key-usage",
        default_values = ["KeyEncipherment", "DigitalSignature", "ServerAuthentication"]
    )]
    key_usage: Vec<String>,
    #[arg(long, default_value = "TPM_ALG_ECDSA")]
    key_pair_algorithm: String,
    #[arg(long, default_value = "2048")]
    key_bit_length: u32,
    #[arg(long, default_value = "SHA256")]
    hash_algorithm: String,
}

impl CsrArgs {
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "CertificateCollection": { "@odata.id": self.certificate_collection },
            "Country": self.country,
            "State": self.state,
            "City": self.city,
            "Organization": self.organization,
            "OrganizationalUnit": self.organizational_unit,
            "CommonName": self.common_name,
            "AlternativeNames": self.alternative_names,
            "KeyUsage": self.key_usage,
            "KeyPairAlgorithm": self.key_pair_algorithm,
            "KeyBitLength": self.key_bit_length,
            "HashAlgorithm": self.hash_algorithm,
        })
    }
}

pub fn replace_certificate_payload(
    certificate_pem: &str,
    certificate_uri: &str,
) -> serde_json::Value {
    serde_json::json!({
        "CertificateUri": { "@odata.id": certificate_uri },
        "CertificateString": certificate_pem,
        "CertificateType": "PEM",
    })
}

pub fn update_parameters(apply_time: &str) -> serde_json::Value {
    serde_json::json!({ "@Redfish.OperationApplyTime": apply_time })
}

pub struct Client {
    http: reqwest::Client,
    args: Args,
}

impl Client {
    pub async fn new(args: Args) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(*args.connect_timeout)
            .timeout(*args.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .danger_accept_invalid_certs(args.insecure);
        if let Some(address) = args.connect_to {
            let host = args.server.host_str().ok_or_else(|| Error::NoHost(args.server.clone()))?;
            debug!(message = "overriding server address", host, %address);
            builder = builder.resolve(host, address);
        }
        if let Some(path) = &args.ca_cert {
            let pem = read_pem(path).await?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Certificate(e, path.clone()))?;
            builder = builder.add_root_certificate(ca);
        }
        if let Some(path) = &args.client_cert {
            let mut pem = read_pem(path).await?;
            if let Some(key) = &args.client_key {
                pem.push(b'\n');
                pem.extend(read_pem(key).await?);
            }
            let identity = reqwest::Identity::from_pem(&pem).map_err(Error::Identity)?;
            builder = builder.identity(identity);
        }
        let http = builder.build().map_err(Error::CreateClient)?;
        Ok(Self { http, args })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.args.server.clone();
        url.path_segments_mut()
            .map_err(|()| Error::CannotBeABase(self.args.server.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn post(&self, url: Url) -> Result<RequestBuilder, Error> {
        let mut request = self
            .http
            .post(url)
            .basic_auth(&self.args.username, Some(&self.args.password))
            .header(CONNECTION, "close");
        if let Some(host) = &self.args.host {
            let value =
                HeaderValue::from_str(host).map_err(|e| Error::InvalidHost(host.clone(), e))?;
            request = request.header(HOST, value);
        }
        Ok(request)
    }

    async fn execute(&self, url: Url, request: RequestBuilder) -> Result<Reply, Error> {
        debug!(message = "sending request", %url);
        let response =
            request.send().await.map_err(|e| Error::Request(Method::POST, url.clone(), e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| Error::Request(Method::POST, url, e))?;
        debug!(message = "response", %status, length = body.len());
        if !status.is_success() {
            return Err(Error::Status { status, body });
        }
        Ok(Reply { status, body })
    }

    /// Upload a firmware image through `UpdateFirmwareMultipart`.
    pub async fn upload_firmware(&self, image: &Path, apply_time: &str) -> Result<Reply, Error> {
        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::NoFileName(image.into()))?;
        let file = tokio::fs::File::open(image)
            .await
            .map_err(|e| Error::OpenFile(e, image.into()))?;
        let total = file.metadata().await.map_err(|e| Error::OpenFile(e, image.into()))?.len();
        info!(message = "uploading firmware", file = %image.display(), total);

        let update_file = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(upload_progress(file, total)),
            total,
        )
        .file_name(file_name)
        .mime_str("application/octet-stream")
        .map_err(Error::BuildForm)?;
        let parameters = reqwest::multipart::Part::text(update_parameters(apply_time).to_string())
            .mime_str("application/json")
            .map_err(Error::BuildForm)?;
        let form = reqwest::multipart::Form::new()
            .part("UpdateFile", update_file)
            .part("UpdateParameters", parameters);

        let url = self.endpoint(&["UpdateFirmwareMultipart"])?;
        let request = self.post(url.clone())?.multipart(form);
        self.execute(url, request).await
    }

    /// Ask the controller to generate a key pair and return the PEM encoded CSR.
    pub async fn generate_csr(&self, csr: &CsrArgs) -> Result<String, Error> {
        let url = self.endpoint(&[
            "redfish",
            "v1",
            "CertificateService",
            "Actions",
            "CertificateService.GenerateCSR",
        ])?;
        let request = self.post(url.clone())?.json(&csr.payload());
        let reply = self.execute(url.clone(), request).await?;
        let value: serde_json::Value =
            serde_json::from_str(&reply.body).map_err(|e| Error::DecodeJson(url, e))?;
        value
            .get("CSRString")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or(Error::MissingCsr)
    }

    pub async fn replace_certificate(
        &self,
        certificate_pem: &str,
        certificate_uri: &str,
    ) -> Result<Reply, Error> {
        let url = self.endpoint(&[
            "redfish",
            "v1",
            "CertificateService",
            "Actions",
            "CertificateService.ReplaceCertificate",
        ])?;
        let payload = replace_certificate_payload(certificate_pem, certificate_uri);
        let request = self.post(url.clone())?.json(&payload);
        self.execute(url, request).await
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.map_err(|e| Error::OpenFile(e, path.into()))
}

/// Read `file` in chunks, logging how much of it has been handed to the HTTP client.
fn upload_progress(
    mut file: tokio::fs::File,
    total: u64,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut buffer = vec![0; UPLOAD_CHUNK];
        let mut sent = 0u64;
        let mut last_report = tokio::time::Instant::now();
        loop {
            match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    sent += n as u64;
                    if last_report.elapsed() >= PROGRESS_INTERVAL || sent == total {
                        last_report = tokio::time::Instant::now();
                        info!(message = "upload progress", sent, total);
                    }
                    yield Ok(buffer[..n].to_vec());
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;
    use futures::StreamExt as _;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    async fn client_with(args: &[&str]) -> Client {
        let args = Args::parse_from(std::iter::once("redfish").chain(args.iter().copied()));
        Client::new(args).await.unwrap()
    }

    async fn client(server: &str) -> Client {
        client_with(&["--server", server]).await
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("board-rtu-tools-{}-{name}", std::process::id()))
    }

    /// Accept one HTTP request, answer it with `status` and `body` and hand back the raw request.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0; 4096];
            while !is_complete(&request) {
                let n = socket.read(&mut buffer).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8(request).unwrap()
        });
        (address, task)
    }

    fn is_complete(request: &[u8]) -> bool {
        let Some(head_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = std::str::from_utf8(&request[..head_end]).unwrap();
        let body = &request[head_end + 4..];
        match header(head, "content-length") {
            Some(length) => body.len() >= length.parse::<usize>().unwrap(),
            None => body.ends_with(b"0\r\n\r\n"),
        }
    }

    fn header<'a>(request: &'a str, name: &str) -> Option<&'a str> {
        request
            .lines()
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
    }

    #[tokio::test]
    async fn endpoints_extend_the_server_path() {
        let root = client("https://192.168.1.231:8443/").await;
        let url = root.endpoint(&["UpdateFirmwareMultipart"]).unwrap();
        assert_eq!(url.as_str(), "https://192.168.1.231:8443/UpdateFirmwareMultipart");
        let prefixed = client("http://bmc.local/prefix").await;
        let url = prefixed.endpoint(&["redfish", "v1"]).unwrap();
        assert_eq!(url.as_str(), "http://bmc.local/prefix/redfish/v1");
    }

    #[test]
    fn csr_payload_uses_redfish_names() {
        let csr = CsrArgs::parse_from(["csr", "--common-name", "bmc.example"]);
        let payload = csr.payload();
        assert_eq!(payload["CommonName"], "bmc.example");
        assert_eq!(payload["KeyBitLength"], 2048);
        assert_eq!(
            payload["CertificateCollection"]["@odata.id"],
            "/redfish/v1/Managers/Kenmec/NetworkProtocol/HTTPS/Certificates"
        );
        assert_eq!(payload["AlternativeNames"], serde_json::json!(["Dexatek.local", "127.0.0.1"]));
    }

    #[test]
    fn repeated_alternative_names_replace_the_defaults() {
        let csr = CsrArgs::parse_from([
            "csr",
            "--alternative-name",
            "a.local",
            "--alternative-name",
            "10.0.0.1",
        ]);
        assert_eq!(csr.payload()["AlternativeNames"], serde_json::json!(["a.local", "10.0.0.1"]));
    }

    #[test]
    fn replace_payload_is_pem() {
        let payload = replace_certificate_payload("-----BEGIN CERTIFICATE-----", "/cert/1");
        assert_eq!(payload["CertificateType"], "PEM");
        assert_eq!(payload["CertificateUri"]["@odata.id"], "/cert/1");
        assert_eq!(payload["CertificateString"], "-----BEGIN CERTIFICATE-----");
    }

    #[test]
    fn apply_time_parameter() {
        assert_eq!(
            update_parameters("OnReset").to_string(),
            r#"{"@Redfish.OperationApplyTime":"OnReset"}"#
        );
    }

    #[test]
    fn pretty_body_falls_back_to_text() {
        let reply = Reply { status: reqwest::StatusCode::OK, body: "not json".into() };
        assert_eq!(reply.pretty_body(), "not json");
        let reply = Reply { status: reqwest::StatusCode::OK, body: r#"{"a":1}"#.into() };
        assert_eq!(reply.pretty_body(), "{\n  \"a\": 1\n}");
    }

    #[tokio::test]
    async fn upload_stream_yields_the_whole_file() {
        let path = temp_path("chunks.bin");
        let content: Vec<u8> = (0..UPLOAD_CHUNK * 2 + 17).map(|i| i as u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();
        let file = tokio::fs::File::open(&path).await.unwrap();
        let chunks = upload_progress(file, content.len() as u64)
            .map(|c| c.unwrap())
            .collect::<Vec<_>>()
            .await;
        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(chunks.concat(), content);
    }

    #[tokio::test]
    async fn missing_firmware_is_reported() {
        let err = client("http://127.0.0.1:9")
            .await
            .upload_firmware(Path::new("/nonexistent/firmware.bin"), "Immediate")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OpenFile(_, _)));
    }

    #[tokio::test]
    async fn firmware_is_uploaded_as_a_multipart_form() {
        let (address, server) = serve_once("202 Accepted", r#"{"Id":"1"}"#).await;
        let image = temp_path("fw.bin");
        tokio::fs::write(&image, b"firmware-image-bytes").await.unwrap();
        let client = client(&format!("http://{address}/")).await;
        let reply = client.upload_firmware(&image, "OnReset").await.unwrap();
        tokio::fs::remove_file(&image).await.unwrap();
        assert_eq!(reply.status, reqwest::StatusCode::ACCEPTED);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /UpdateFirmwareMultipart HTTP/1.1\r\n"));
        assert_eq!(header(&request, "authorization"), Some("Basic YWRtaW46YWRtaW4xMjM="));
        assert_eq!(header(&request, "connection"), Some("close"));
        assert!(header(&request, "content-type").unwrap().starts_with("multipart/form-data"));
        assert!(header(&request, "content-length").is_some());
        let lowercase = request.to_lowercase();
        let file_name = format!("name=\"updatefile\"; filename=\"{}\"", image_name(&image));
        assert!(lowercase.contains(&file_name), "{request}");
        assert!(lowercase.contains("content-type: application/octet-stream"));
        assert!(lowercase.contains("name=\"updateparameters\""));
        assert!(lowercase.contains("content-type: application/json"));
        assert!(request.contains("firmware-image-bytes"));
        assert!(request.contains(r#"{"@Redfish.OperationApplyTime":"OnReset"}"#));
    }

    fn image_name(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().to_lowercase()
    }

    #[tokio::test]
    async fn csr_string_is_extracted() {
        let body = r#"{"CSRString":"-----BEGIN CERTIFICATE REQUEST-----\nMIIB\n"}"#;
        let (address, server) = serve_once("200 OK", body).await;
        let client = client(&format!("http://{address}")).await;
        let csr = client.generate_csr(&CsrArgs::parse_from(["csr"])).await.unwrap();
        assert_eq!(csr, "-----BEGIN CERTIFICATE REQUEST-----\nMIIB\n");

        let request = server.await.unwrap();
        assert!(request.starts_with(
            "POST /redfish/v1/CertificateService/Actions/CertificateService.GenerateCSR HTTP/1.1"
        ));
        assert_eq!(header(&request, "content-type"), Some("application/json"));
        assert!(request.contains(r#""CommonName":"Dexatek.local""#));
        assert!(request.contains(r#""KeyPairAlgorithm":"TPM_ALG_ECDSA""#));
    }

    #[tokio::test]
    async fn reply_without_csr_is_an_error() {
        let (address, _server) = serve_once("200 OK", r#"{"Message":"done"}"#).await;
        let client = client(&format!("http://{address}")).await;
        let err = client.generate_csr(&CsrArgs::parse_from(["csr"])).await.unwrap_err();
        assert!(matches!(err, Error::MissingCsr));
    }

    #[tokio::test]
    async fn error_status_carries_the_body() {
        let (address, _server) = serve_once("401 Unauthorized", r#"{"error":"denied"}"#).await;
        let client = client(&format!("http://{address}")).await;
        let err = client.replace_certificate("PEM", "/cert/1").await.unwrap_err();
        match err {
            Error::Status { status, body } => {
                assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
                assert_eq!(body, r#"{"error":"denied"}"#);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn certificate_replacement_honours_host_override() {
        let (address, server) = serve_once("200 OK", "{}").await;
        let server_url = format!("http://{address}");
        let client = client_with(&["--server", &server_url, "--host", "Dexatek.local"]).await;
        client.replace_certificate("-----BEGIN CERTIFICATE-----", "/cert/1").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with(
            "POST /redfish/v1/CertificateService/Actions/CertificateService.ReplaceCertificate"
        ));
        assert_eq!(header(&request, "host"), Some("Dexatek.local"));
        assert!(request.contains(r#""CertificateType":"PEM""#));
        assert!(request.contains(r#""CertificateUri":{"@odata.id":"/cert/1"}"#));
    }

    #[tokio::test]
    async fn connect_to_keeps_the_server_host_name() {
        let (address, server) = serve_once("200 OK", "{}").await;
        let server_url = format!("http://bmc.invalid:{}/", address.port());
        let connect_to = address.to_string();
        let client = client_with(&["--server", &server_url, "--connect-to", &connect_to]).await;
        client.replace_certificate("PEM", "/cert/1").await.unwrap();
        let request = server.await.unwrap();
        assert_eq!(header(&request, "host"), Some(&*format!("bmc.invalid:{}", address.port())));
    }

    #[tokio::test]
    async fn client_identity_must_be_valid_pem() {
        let cert = temp_path("client.crt");
        tokio::fs::write(&cert, b"not a certificate").await.unwrap();
        let args = Args::parse_from(["redfish", "--client-cert", cert.to_str().unwrap()]);
        let result = Client::new(args).await;
        tokio::fs::remove_file(&cert).await.unwrap();
        assert!(matches!(result, Err(Error::Identity(_))));
    }

    #[tokio::test]
    async fn missing_ca_certificate_is_reported() {
        let args = Args::parse_from(["redfish", "--ca-cert", "/nonexistent/ca.crt"]);
        assert!(matches!(Client::new(args).await, Err(Error::OpenFile(_, _))));
    }

    #[test]
    fn client_key_requires_a_certificate() {
        assert!(Args::try_parse_from(["redfish", "--client-key", "client.key"]).is_err());
        assert!(Args::try_parse_from(["redfish", "--insecure", "--ca-cert", "ca.crt"]).is_err());
    }
}
