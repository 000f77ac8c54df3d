use crate::{distribution::*, error::*, media_types, Digest, Manifest, Reference};
use std::io::{self, Read};
use url::Url;

/// A client for `/v2/<namespace>/` API endpoint
pub struct Client {
    agent: ureq::Agent,
    /// `https://<host>/v2/`, or `http://` for insecure registries
    base: Url,
    host: String,
    namespace: String,
    credentials: Box<dyn CredentialsProvider>,
    /// Shared between concurrent layer transfers
    auth: AuthenticationKeeper,
    /// Upload blobs with PATCH requests of this size instead of a single PUT
    upload_chunk_size: Option<usize>,
}

impl Client {
    pub fn new(
        host: &str,
        namespace: &str,
        insecure: bool,
        credentials: Box<dyn CredentialsProvider>,
    ) -> Result<Self> {
        let scheme = if insecure { "http" } else { "https" };
        Ok(Client {
            agent: ureq::Agent::new(),
            base: Url::parse(&format!("{}://{}/v2/", scheme, host))?,
            host: host.to_string(),
            namespace: namespace.to_string(),
            credentials,
            auth: AuthenticationKeeper::default(),
            upload_chunk_size: None,
        })
    }

    pub fn from_remote_name(
        name: &RemoteName,
        insecure: bool,
        credentials: Box<dyn CredentialsProvider>,
    ) -> Result<Self> {
        Self::new(&name.host, &name.namespace, insecure, credentials)
    }

    /// Upload blobs in chunks of `size` bytes, `None` or `0` for monolithic uploads
    pub fn with_upload_chunk_size(mut self, size: Option<usize>) -> Self {
        self.upload_chunk_size = size.filter(|size| *size > 0);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(&format!("{}/{}", self.namespace, path))?)
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        log::info!("{} {}", method, url);
        self.agent.request(method, url.as_str())
    }

    /// Send with the cached authentication, and on 401 authenticate then retry exactly once
    ///
    /// Any HTTP status is returned as `Ok`, callers check the code themselves.
    fn send(&self, req: ureq::Request, body: Option<&[u8]>) -> Result<ureq::Response> {
        let res = self.send_once(req.clone(), body)?;
        if res.status() != 401 {
            return Ok(res);
        }
        let header = res.header("WWW-Authenticate").ok_or_else(|| {
            Error::AuthorizationFailed("401 response without WWW-Authenticate header".to_string())
        })?;
        let challenge = WwwAuthenticate::parse(header)?;
        self.authenticate(&challenge)?;
        self.send_once(req, body)
    }

    fn send_once(&self, mut req: ureq::Request, body: Option<&[u8]>) -> Result<ureq::Response> {
        if let Some(header) = self.auth.header() {
            req = req.set("Authorization", &header);
        }
        let res = match body {
            Some(body) => req.send_bytes(body),
            None => req.call(),
        };
        match res {
            Ok(res) | Err(ureq::Error::Status(_, res)) => Ok(res),
            Err(ureq::Error::Transport(e)) => Err(Error::NetworkError(e.into())),
        }
    }

    fn authenticate(&self, challenge: &WwwAuthenticate) -> Result<()> {
        let credentials = self.credentials.retrieve(&self.host)?;
        if challenge.scheme.eq_ignore_ascii_case("basic") {
            let (user, password) = credentials.ok_or_else(|| {
                Error::AuthorizationFailed(format!("no credentials for {}", self.host))
            })?;
            self.auth.set(Authentication::Basic { user, password });
            return Ok(());
        }
        if !challenge.scheme.eq_ignore_ascii_case("bearer") {
            return Err(Error::AuthorizationFailed(format!(
                "unsupported authentication scheme {}",
                challenge.scheme
            )));
        }

        let realm = challenge.directives.get("realm").ok_or_else(|| {
            Error::AuthorizationFailed("Bearer challenge without realm".to_string())
        })?;
        let mut token_url = Url::parse(realm)?;
        for key in ["scope", "service"] {
            if let Some(value) = challenge.directives.get(key) {
                token_url.query_pairs_mut().append_pair(key, value);
            }
        }
        log::info!("GET {}", token_url);
        let mut req = self
            .agent
            .get(token_url.as_str())
            .set("Accept", "application/json");
        if let Some((user, password)) = credentials {
            req = req.set("Authorization", &Authentication::Basic { user, password }.header());
        }
        let token = match req.call() {
            Ok(res) => res.into_json::<TokenResponse>()?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(Error::AuthorizationFailed(format!(
                    "token endpoint {} returned {}",
                    realm, code
                )))
            }
            Err(ureq::Error::Transport(e)) => return Err(Error::NetworkError(e.into())),
        };
        self.auth.set(token.into_authentication()?);
        Ok(())
    }

    /// Check the registry is reachable and we are authorized
    ///
    /// ```text
    /// GET /v2/
    /// ```
    pub fn ping(&self) -> Result<bool> {
        let res = self.send(self.request("GET", &self.base), None)?;
        Ok(res.status() == 200)
    }

    /// Push blob in the configured upload mode and return its digest
    pub fn push_blob_bytes(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::from_buf_sha256(data);
        self.upload_blob(data, &digest)?;
        Ok(digest)
    }

    /// Push blob to registry
    ///
    /// ```text
    /// POST /v2/<namespace>/blobs/uploads/
    /// ```
    ///
    /// followed by `PATCH` requests and/or the final `PUT` to the URL obtained by `POST`.
    fn upload_blob(&self, data: &[u8], digest: &Digest) -> Result<()> {
        let url = self.endpoint("blobs/uploads/")?;
        let res = self.send(self.request("POST", &url), Some(&[]))?;
        let res = expect_status(res, &[202], "initiating blob upload")?;
        let mut location = self.location(&res)?;

        let mut tail = data;
        if let Some(chunk_size) = self.upload_chunk_size {
            let mut offset = 0;
            for chunk in data.chunks(chunk_size) {
                let range = format!("{}-{}", offset, offset + chunk.len() - 1);
                let req = self
                    .request("PATCH", &location)
                    .set("Content-Type", "application/octet-stream")
                    .set("Content-Range", &range);
                let res = self.send(req, Some(chunk))?;
                let res = expect_status(res, &[202], "uploading blob chunk")?;
                location = self.location(&res)?;
                offset += chunk.len();
            }
            tail = &[];
        }

        location
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());
        let req = self
            .request("PUT", &location)
            .set("Content-Type", "application/octet-stream");
        let res = self.send(req, Some(tail))?;
        expect_status(res, &[201], "finishing blob upload")?;
        Ok(())
    }

    /// Absolute URL of the `Location` header, which registries may send as a path
    fn location(&self, res: &ureq::Response) -> Result<Url> {
        let location = res.header("Location").ok_or(Error::MissingLocationHeader)?;
        Ok(self.base.join(location)?)
    }
}

impl Remote for Client {
    /// Get manifest for given reference
    ///
    /// ```text
    /// GET /v2/<namespace>/manifests/<reference>
    /// ```
    fn pull_manifest(&self, reference: &Reference) -> Result<(Manifest, Vec<u8>)> {
        let url = self.endpoint(&format!("manifests/{}", reference.value()))?;
        let req = self
            .request("GET", &url)
            .set("Accept", media_types::OCI_MANIFEST);
        let res = expect_status(self.send(req, None)?, &[200], "pulling manifest")?;
        let mut raw = Vec::new();
        res.into_reader().read_to_end(&mut raw)?;
        Ok((Manifest::from_json(&raw)?, raw))
    }

    /// Push manifest to registry
    ///
    /// ```text
    /// PUT /v2/<namespace>/manifests/<reference>
    /// ```
    ///
    /// Manifest must be pushed after blobs are uploaded.
    fn push_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<Digest> {
        let body = manifest.to_canonical_json()?;
        let url = self.endpoint(&format!("manifests/{}", reference.value()))?;
        let req = self
            .request("PUT", &url)
            .set("Content-Type", media_types::OCI_MANIFEST);
        expect_status(self.send(req, Some(&body))?, &[201], "pushing manifest")?;
        Ok(Digest::from_buf_sha256(&body))
    }

    /// ```text
    /// HEAD /v2/<namespace>/blobs/<digest>
    /// ```
    fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        let url = self.endpoint(&format!("blobs/{}", digest))?;
        let res = self.send(self.request("HEAD", &url), None)?;
        match res.status() {
            200 => Ok(true),
            404 => Ok(false),
            _ => expect_status(res, &[200, 404], "checking blob existence").map(|_| false),
        }
    }

    fn push_blob(&self, data: &[u8], digest: &Digest) -> Result<()> {
        self.upload_blob(data, digest)
    }

    /// Get blob for given digest, starting at `offset`
    ///
    /// ```text
    /// GET /v2/<namespace>/blobs/<digest>
    /// ```
    fn pull_blob(&self, digest: &Digest, offset: u64) -> Result<Box<dyn Read + Send + Sync>> {
        let url = self.endpoint(&format!("blobs/{}", digest))?;
        let mut req = self.request("GET", &url);
        if offset > 0 {
            req = req.set("Range", &format!("bytes={}-", offset));
        }
        let res = expect_status(self.send(req, None)?, &[200, 206], "pulling blob")?;
        let partial = res.status() == 206;
        let mut reader = res.into_reader();
        if offset > 0 && !partial {
            // Range was ignored, the body starts from the beginning
            io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
        }
        Ok(reader)
    }
}

fn expect_status(res: ureq::Response, expected: &[u16], when: &'static str) -> Result<ureq::Response> {
    if expected.contains(&res.status()) {
        return Ok(res);
    }
    Err(Error::UnexpectedHttpStatus {
        when,
        code: res.status(),
        details: res.into_string().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{manifest::Descriptor, media_types};
    use mockito::{Matcher, Server};

    fn client(server: &Server, credentials: Box<dyn CredentialsProvider>) -> Client {
        Client::new(&server.host_with_port(), "vm/macos", true, credentials).unwrap()
    }

    fn anonymous(server: &Server) -> Client {
        client(server, Box::new(CredentialsChain::default()))
    }

    fn manifest() -> Manifest {
        let config = Descriptor {
            media_type: media_types::OCI_CONFIG.to_string(),
            size: 2,
            digest: Digest::from_buf_sha256(b"{}"),
        };
        Manifest::new(config, vec![], Some(0), None)
    }

    #[test]
    fn ping() -> Result<()> {
        let mut server = Server::new();
        let mock = server.mock("GET", "/v2/").with_status(200).create();
        assert!(anonymous(&server).ping()?);
        mock.assert();
        Ok(())
    }

    #[test]
    fn bearer_negotiation() -> Result<()> {
        let mut server = Server::new();
        let raw = manifest().to_canonical_json()?;
        let challenge = server
            .mock("GET", "/v2/vm/macos/manifests/latest")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header(
                "WWW-Authenticate",
                &format!(
                    r#"Bearer realm="{}/token",service="y",scope="repository:vm/macos:pull""#,
                    server.url()
                ),
            )
            .expect(1)
            .create();
        let token = server
            .mock("GET", "/token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("service".into(), "y".into()),
                Matcher::UrlEncoded("scope".into(), "repository:vm/macos:pull".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"token":"abc","expires_in":300}"#)
            .expect(1)
            .create();
        let authorized = server
            .mock("GET", "/v2/vm/macos/manifests/latest")
            .match_header("authorization", "Bearer abc")
            .match_header("accept", media_types::OCI_MANIFEST)
            .with_status(200)
            .with_body(&raw)
            .expect(2)
            .create();

        let client = anonymous(&server);
        let (pulled, pulled_raw) = client.pull_manifest(&Reference::latest())?;
        assert_eq!(pulled, manifest());
        assert_eq!(pulled_raw, raw);
        // Token is reused, no more challenge
        client.pull_manifest(&Reference::latest())?;

        challenge.assert();
        token.assert();
        authorized.assert();
        Ok(())
    }

    #[test]
    fn basic_negotiation() -> Result<()> {
        let mut server = Server::new();
        let challenge = server
            .mock("GET", "/v2/")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("WWW-Authenticate", r#"Basic realm="registry""#)
            .create();
        let authorized = server
            .mock("GET", "/v2/")
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .with_status(200)
            .create();
        let client = client(
            &server,
            Box::new(StaticCredentials::new("user", "pass")),
        );
        assert!(client.ping()?);
        challenge.assert();
        authorized.assert();

        // Without credentials basic auth cannot succeed
        assert!(matches!(
            anonymous(&server).ping(),
            Err(Error::AuthorizationFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn unsupported_challenge() {
        let mut server = Server::new();
        server
            .mock("GET", "/v2/")
            .with_status(401)
            .with_header("WWW-Authenticate", r#"Digest realm="x""#)
            .create();
        assert!(matches!(
            anonymous(&server).ping(),
            Err(Error::AuthorizationFailed(_))
        ));

        let mut server = Server::new();
        server.mock("GET", "/v2/").with_status(401).create();
        assert!(matches!(
            anonymous(&server).ping(),
            Err(Error::AuthorizationFailed(_))
        ));
    }

    #[test]
    fn push_manifest() -> Result<()> {
        let mut server = Server::new();
        let body = manifest().to_canonical_json()?;
        let mock = server
            .mock("PUT", "/v2/vm/macos/manifests/latest")
            .match_header("content-type", media_types::OCI_MANIFEST)
            .match_body(std::str::from_utf8(&body).unwrap())
            .with_status(201)
            .create();
        let digest = anonymous(&server).push_manifest(&Reference::latest(), &manifest())?;
        assert_eq!(digest, Digest::from_buf_sha256(&body));
        mock.assert();

        let mut server = Server::new();
        server
            .mock("PUT", "/v2/vm/macos/manifests/latest")
            .with_status(400)
            .with_body("MANIFEST_INVALID")
            .create();
        match anonymous(&server).push_manifest(&Reference::latest(), &manifest()) {
            Err(Error::UnexpectedHttpStatus { code, details, .. }) => {
                assert_eq!(code, 400);
                assert_eq!(details, "MANIFEST_INVALID");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[test]
    fn monolithic_upload() -> Result<()> {
        let mut server = Server::new();
        let data = b"monolithic blob".to_vec();
        let digest = Digest::from_buf_sha256(&data);
        let post = server
            .mock("POST", "/v2/vm/macos/blobs/uploads/")
            .with_status(202)
            .with_header("Location", "/v2/vm/macos/blobs/uploads/session-1?state=x")
            .create();
        let put = server
            .mock("PUT", "/v2/vm/macos/blobs/uploads/session-1")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("state".into(), "x".into()),
                Matcher::UrlEncoded("digest".into(), digest.to_string()),
            ]))
            .match_body("monolithic blob")
            .with_status(201)
            .create();
        assert_eq!(anonymous(&server).push_blob_bytes(&data)?, digest);
        post.assert();
        put.assert();
        Ok(())
    }

    #[test]
    fn chunked_upload() -> Result<()> {
        let mut server = Server::new();
        let data = b"0123456789".to_vec();
        let digest = Digest::from_buf_sha256(&data);
        server
            .mock("POST", "/v2/vm/macos/blobs/uploads/")
            .with_status(202)
            .with_header("Location", "/upload/0")
            .create();
        let patches: Vec<_> = [(0, "0-3", "0123"), (1, "4-7", "4567"), (2, "8-9", "89")]
            .into_iter()
            .map(|(i, range, body)| {
                server
                    .mock("PATCH", format!("/upload/{}", i).as_str())
                    .match_header("content-range", range)
                    .match_body(body)
                    .with_status(202)
                    .with_header("Location", &format!("/upload/{}", i + 1))
                    .expect(1)
                    .create()
            })
            .collect();
        let put = server
            .mock("PUT", "/upload/3")
            .match_query(Matcher::UrlEncoded("digest".into(), digest.to_string()))
            .with_status(201)
            .create();

        let client = anonymous(&server).with_upload_chunk_size(Some(4));
        client.push_blob(&data, &digest)?;
        for patch in patches {
            patch.assert();
        }
        put.assert();
        Ok(())
    }

    #[test]
    fn blob_exists() -> Result<()> {
        let mut server = Server::new();
        let present = Digest::from_buf_sha256(b"present");
        let absent = Digest::from_buf_sha256(b"absent");
        server
            .mock("HEAD", format!("/v2/vm/macos/blobs/{}", present).as_str())
            .with_status(200)
            .create();
        server
            .mock("HEAD", format!("/v2/vm/macos/blobs/{}", absent).as_str())
            .with_status(404)
            .create();
        let client = anonymous(&server);
        assert!(client.blob_exists(&present)?);
        assert!(!client.blob_exists(&absent)?);
        Ok(())
    }

    #[test]
    fn pull_blob_with_offset() -> Result<()> {
        let mut server = Server::new();
        let digest = Digest::from_buf_sha256(b"0123456789");
        let path = format!("/v2/vm/macos/blobs/{}", digest);
        server
            .mock("GET", path.as_str())
            .match_header("range", "bytes=4-")
            .with_status(206)
            .with_body("456789")
            .create();
        server
            .mock("GET", path.as_str())
            .match_header("range", Matcher::Missing)
            .with_status(200)
            .with_body("0123456789")
            .create();
        let client = anonymous(&server);

        let mut buf = Vec::new();
        client.pull_blob_to(&digest, &mut buf)?;
        assert_eq!(buf, b"0123456789");

        let mut rest = String::new();
        client.pull_blob(&digest, 4)?.read_to_string(&mut rest)?;
        assert_eq!(rest, "456789");
        Ok(())
    }

    #[test]
    fn range_ignored_by_registry() -> Result<()> {
        let mut server = Server::new();
        let digest = Digest::from_buf_sha256(b"0123456789");
        server
            .mock("GET", format!("/v2/vm/macos/blobs/{}", digest).as_str())
            .with_status(200)
            .with_body("0123456789")
            .create();
        let mut rest = String::new();
        anonymous(&server).pull_blob(&digest, 7)?.read_to_string(&mut rest)?;
        assert_eq!(rest, "789");
        Ok(())
    }

    //
    // Following tests need registry server at localhost:5000, e.g. `docker run -p 5000:5000 registry:2`.
    // These tests are ignored by default.
    //

    #[test]
    #[ignore]
    fn local_registry_roundtrip() -> Result<()> {
        let client = Client::new("localhost:5000", "test_repo", true, Box::new(CredentialsChain::default()))?;
        assert!(client.ping()?);
        let digest = client.push_blob_bytes(b"test string")?;
        assert!(client.blob_exists(&digest)?);
        Ok(())
    }
}
