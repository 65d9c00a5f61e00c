use crate::ProviderError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::Path;
use unikit_schema::{HubConfig, Image};

/// Client for the image hub.
///
/// Expects a simple REST API:
/// - `GET    /images`              list image records (JSON array)
/// - `GET    /images/<name>`       fetch one image record
/// - `PUT    /images/<name>`       upload an image record
/// - `DELETE /images/<name>`       delete record and blob
/// - `GET    /images/<name>/blob`  download the packed image directory
/// - `PUT    /images/<name>/blob`  upload the packed image directory
pub struct HubClient {
    config: HubConfig,
    agent: ureq::Agent,
}

/// An image record as stored on the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HubImage {
    pub image: Image,
    #[serde(default)]
    pub owner: String,
    /// blake3 of the packed blob.
    pub digest: String,
}

impl HubClient {
    pub fn new(config: &HubConfig) -> Self {
        let agent = ureq::Agent::new_with_defaults();
        Self {
            config: HubConfig {
                url: config.url.trim_end_matches('/').to_owned(),
                ..config.clone()
            },
            agent,
        }
    }

    fn image_url(&self, name: &str) -> String {
        format!("{}/images/{name}", self.config.url)
    }

    fn blob_url(&self, name: &str) -> String {
        format!("{}/images/{name}/blob", self.config.url)
    }

    fn do_put(&self, url: &str, content_type: &str, data: &[u8]) -> Result<(), ProviderError> {
        self.agent
            .put(url)
            .header("Content-Type", content_type)
            .header("X-Unikit-User", &self.config.user)
            .header("X-Unikit-Password", &self.config.pass)
            .send(data)
            .map_err(|e| ProviderError::Hub(e.to_string()))?;
        Ok(())
    }

    fn do_get(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        let resp = match self
            .agent
            .get(url)
            .header("X-Unikit-User", &self.config.user)
            .header("X-Unikit-Password", &self.config.pass)
            .call()
        {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(ProviderError::NotFound {
                    kind: "hub image",
                    query: url.to_owned(),
                });
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(ProviderError::Hub(format!("HTTP {code} for {url}")));
            }
            Err(e) => return Err(ProviderError::Hub(e.to_string())),
        };

        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| ProviderError::Hub(e.to_string()))?;
        Ok(body)
    }

    pub fn list_images(&self) -> Result<Vec<HubImage>, ProviderError> {
        let url = format!("{}/images", self.config.url);
        tracing::debug!("GET {url}");
        let body = self.do_get(&url)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn get_image(&self, name: &str) -> Result<HubImage, ProviderError> {
        let url = self.image_url(name);
        tracing::debug!("GET {url}");
        let body = self.do_get(&url)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Upload `archive` as the blob for `image`, then its record.
    ///
    /// The record goes last so a reader never sees a record whose blob is
    /// missing.
    pub fn push(&self, image: &Image, archive: &[u8]) -> Result<HubImage, ProviderError> {
        let record = HubImage {
            image: image.clone(),
            owner: self.config.user.clone(),
            digest: blake3::hash(archive).to_hex().to_string(),
        };
        let blob_url = self.blob_url(&image.name);
        tracing::debug!("PUT {blob_url} ({} bytes)", archive.len());
        self.do_put(&blob_url, "application/x-tar", archive)?;

        let image_url = self.image_url(&image.name);
        tracing::debug!("PUT {image_url}");
        self.do_put(&image_url, "application/json", &serde_json::to_vec(&record)?)?;
        Ok(record)
    }

    /// Download an image record and its blob, verifying the blob digest.
    pub fn pull(&self, name: &str) -> Result<(HubImage, Vec<u8>), ProviderError> {
        let record = self.get_image(name)?;
        let url = self.blob_url(name);
        tracing::debug!("GET {url}");
        let archive = self.do_get(&url)?;
        let digest = blake3::hash(&archive).to_hex().to_string();
        if digest != record.digest {
            return Err(ProviderError::Hub(format!(
                "digest mismatch for {name}: expected {}, got {digest}",
                record.digest
            )));
        }
        Ok((record, archive))
    }

    pub fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let url = self.image_url(name);
        tracing::debug!("DELETE {url}");
        match self
            .agent
            .delete(&url)
            .header("X-Unikit-User", &self.config.user)
            .header("X-Unikit-Password", &self.config.pass)
            .call()
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(404)) => Err(ProviderError::NotFound {
                kind: "hub image",
                query: name.to_owned(),
            }),
            Err(e) => Err(ProviderError::Hub(e.to_string())),
        }
    }
}

/// Pack the regular files of a flat image directory into a tar archive.
///
/// Entries are sorted by name with zeroed timestamps and ownership, so the
/// same directory always yields the same archive and digest.
pub fn pack_image_dir(dir: &Path) -> Result<Vec<u8>, ProviderError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();

    let mut ar = tar::Builder::new(Vec::new());
    for name in &files {
        let data = fs::read(dir.join(name))?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        ar.append_data(&mut header, name, data.as_slice())?;
    }
    Ok(ar.into_inner()?)
}

/// Extract an archive produced by [`pack_image_dir`] into `dir`.
pub fn unpack_image_dir(archive: &[u8], dir: &Path) -> Result<(), ProviderError> {
    fs::create_dir_all(dir)?;
    let mut ar = tar::Archive::new(archive);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.unpack(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use unikit_schema::{ImageId, Infrastructure, RunSpec, StageSpec};

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        path: String,
        headers: HashMap<String, String>,
    }

    type Blobs = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    struct MockHub {
        url: String,
        blobs: Blobs,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    impl MockHub {
        fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let blobs: Blobs = Arc::new(Mutex::new(HashMap::new()));
            let requests = Arc::new(Mutex::new(Vec::new()));

            let store = Arc::clone(&blobs);
            let reqs = Arc::clone(&requests);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let store = Arc::clone(&store);
                    let reqs = Arc::clone(&reqs);
                    std::thread::spawn(move || {
                        let mut reader = BufReader::new(stream.try_clone().unwrap());
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).is_err() {
                            return;
                        }
                        let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                        if parts.len() < 2 {
                            return;
                        }
                        let method = parts[0].to_owned();
                        let path = parts[1].to_owned();

                        let mut content_length = 0usize;
                        let mut headers = HashMap::new();
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                                break;
                            }
                            if let Some((k, v)) = line.trim().split_once(": ") {
                                let k = k.to_lowercase();
                                if k == "content-length" {
                                    content_length = v.trim().parse().unwrap_or(0);
                                }
                                headers.insert(k, v.to_owned());
                            }
                        }
                        let mut body = vec![0u8; content_length];
                        if content_length > 0 {
                            let _ = reader.read_exact(&mut body);
                        }
                        reqs.lock().unwrap().push(CapturedRequest {
                            method: method.clone(),
                            path: path.clone(),
                            headers,
                        });

                        let mut data = store.lock().unwrap();
                        let (status, payload) = match method.as_str() {
                            "PUT" => {
                                data.insert(path, body);
                                ("200 OK", Vec::new())
                            }
                            "GET" if path == "/images" => {
                                let records: Vec<serde_json::Value> = data
                                    .iter()
                                    .filter(|(k, _)| !k.ends_with("/blob"))
                                    .map(|(_, v)| serde_json::from_slice(v).unwrap())
                                    .collect();
                                ("200 OK", serde_json::to_vec(&records).unwrap())
                            }
                            "GET" => match data.get(&path) {
                                Some(v) => ("200 OK", v.clone()),
                                None => ("404 Not Found", Vec::new()),
                            },
                            "DELETE" => {
                                let blob = format!("{path}/blob");
                                data.remove(&blob);
                                match data.remove(&path) {
                                    Some(_) => ("200 OK", Vec::new()),
                                    None => ("404 Not Found", Vec::new()),
                                }
                            }
                            _ => ("405 Method Not Allowed", Vec::new()),
                        };
                        let head = format!(
                            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            payload.len()
                        );
                        let _ = stream.write_all(head.as_bytes());
                        let _ = stream.write_all(&payload);
                        let _ = stream.flush();
                    });
                }
            });

            MockHub {
                url,
                blobs,
                requests,
            }
        }

        fn client(&self) -> HubClient {
            HubClient::new(&HubConfig {
                url: format!("{}/", self.url),
                user: "alice".to_owned(),
                pass: "s3cret".to_owned(),
            })
        }
    }

    fn image(name: &str) -> Image {
        Image {
            id: ImageId::new(name),
            name: name.to_owned(),
            size_mb: 3,
            infrastructure: Infrastructure::Qemu,
            created: Utc::now(),
            stage_spec: StageSpec::default(),
            run_spec: RunSpec::default(),
        }
    }

    fn image_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("boot.img"), b"boot sector").unwrap();
        fs::write(dir.path().join("cmdline"), b"{\"rc\":[]}").unwrap();
        dir
    }

    #[test]
    fn pack_is_deterministic() {
        let dir = image_dir();
        let a = pack_image_dir(dir.path()).unwrap();
        let b = pack_image_dir(dir.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pack_unpack_restores_files() {
        let src = image_dir();
        let archive = pack_image_dir(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack_image_dir(&archive, &dst.path().join("img")).unwrap();
        assert_eq!(
            fs::read(dst.path().join("img").join("boot.img")).unwrap(),
            b"boot sector"
        );
        assert!(dst.path().join("img").join("cmdline").exists());
    }

    #[test]
    fn push_then_pull() {
        let hub = MockHub::start();
        let client = hub.client();
        let dir = image_dir();
        let archive = pack_image_dir(dir.path()).unwrap();

        let pushed = client.push(&image("web"), &archive).unwrap();
        assert_eq!(pushed.owner, "alice");

        let (record, blob) = client.pull("web").unwrap();
        assert_eq!(record.image.name, "web");
        assert_eq!(blob, archive);

        let listed = client.list_images().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].digest, pushed.digest);
    }

    #[test]
    fn requests_carry_credentials() {
        let hub = MockHub::start();
        let client = hub.client();
        client.push(&image("web"), b"blob").unwrap();

        let reqs = hub.requests.lock().unwrap().clone();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].path, "/images/web/blob");
        assert_eq!(reqs[1].path, "/images/web");
        for req in &reqs {
            assert_eq!(req.method, "PUT");
            assert_eq!(req.headers.get("x-unikit-user").map(String::as_str), Some("alice"));
            assert_eq!(
                req.headers.get("x-unikit-password").map(String::as_str),
                Some("s3cret")
            );
        }
    }

    #[test]
    fn corrupted_blob_rejected() {
        let hub = MockHub::start();
        let client = hub.client();
        client.push(&image("web"), b"original").unwrap();
        hub.blobs
            .lock()
            .unwrap()
            .insert("/images/web/blob".to_owned(), b"tampered".to_vec());

        let err = client.pull("web").unwrap_err();
        assert!(matches!(err, ProviderError::Hub(ref m) if m.contains("digest mismatch")));
    }

    #[test]
    fn missing_image_is_not_found() {
        let hub = MockHub::start();
        let client = hub.client();
        assert!(client.pull("ghost").unwrap_err().is_not_found());
        assert!(client.delete("ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_removes_record() {
        let hub = MockHub::start();
        let client = hub.client();
        client.push(&image("web"), b"blob").unwrap();
        client.delete("web").unwrap();
        assert!(client.list_images().unwrap().is_empty());
        assert!(hub.blobs.lock().unwrap().is_empty());
    }

    #[test]
    fn unreachable_hub_fails() {
        let client = HubClient::new(&HubConfig {
            url: "http://127.0.0.1:1".to_owned(),
            ..HubConfig::default()
        });
        assert!(matches!(client.list_images(), Err(ProviderError::Hub(_))));
    }
}
