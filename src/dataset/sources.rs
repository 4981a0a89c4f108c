use polars::prelude::*;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, S3Location};
use crate::db::Warehouse;
use crate::error::{EngineError, Result};
use crate::s3::S3Client;

/// One way of obtaining the raw table.
///
/// `Ok(None)` means the source is not configured or holds nothing; errors
/// mean it was configured but failed. Either way the caller moves on.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(&self) -> Result<Option<DataFrame>>;

    /// True when data from this source already lives in the warehouse and
    /// does not need to be written back
    fn is_persisted(&self) -> bool {
        false
    }
}

/// Result of walking the fallback chain
pub struct Acquired {
    pub frame: DataFrame,
    pub source: String,
    pub persisted: bool,
}

impl Acquired {
    fn empty() -> Self {
        Self {
            frame: DataFrame::empty(),
            source: "empty".to_string(),
            persisted: false,
        }
    }
}

/// Try each source in order and return the first non-empty table. Failures
/// are logged and skipped; when every source comes up empty the result is an
/// empty table.
pub fn acquire(sources: &[Box<dyn Source>]) -> Acquired {
    for source in sources {
        match source.fetch() {
            Ok(Some(frame)) if frame.width() > 0 && frame.height() > 0 => {
                info!(
                    "📦 Acquired {} rows x {} columns from {}",
                    frame.height(),
                    frame.width(),
                    source.name()
                );
                return Acquired {
                    frame,
                    source: source.name().to_string(),
                    persisted: source.is_persisted(),
                };
            }
            Ok(_) => debug!("Source {} has no data", source.name()),
            Err(e) if e.is_source_unavailable() => warn!("Source {} unavailable: {}", source.name(), e),
            Err(e) => warn!("Source {} failed: {}", source.name(), e),
        }
    }
    warn!("No data source produced rows; serving an empty dataset");
    Acquired::empty()
}

/// The standard chain: warehouse table, HTTP payload, S3 object, local
/// Parquet file, uploaded CSV files
pub fn default_sources(config: &EngineConfig, warehouse: &Warehouse) -> Vec<Box<dyn Source>> {
    let mut sources: Vec<Box<dyn Source>> = vec![Box::new(WarehouseSource::new(warehouse.clone()))];
    if let Some(url) = &config.bucket_url {
        sources.push(Box::new(HttpSource::new(
            url.clone(),
            config.api_key.clone(),
            config.fetch_timeout(),
        )));
    }
    if let Some(location) = &config.s3 {
        sources.push(Box::new(S3Source::new(location.clone(), config.fetch_timeout())));
    }
    if let Some(path) = &config.data_path {
        sources.push(Box::new(ParquetFileSource::new(path.clone())));
    }
    sources.push(Box::new(CsvGlobSource::new(config.csv_glob.clone())));
    sources
}

/// Existing `prod.sales` table
pub struct WarehouseSource {
    warehouse: Warehouse,
}

impl WarehouseSource {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }
}

impl Source for WarehouseSource {
    fn name(&self) -> &str {
        "warehouse"
    }

    fn fetch(&self) -> Result<Option<DataFrame>> {
        self.warehouse.load_table()
    }

    fn is_persisted(&self) -> bool {
        true
    }
}

/// Parquet payload behind an HTTP(S) URL
pub struct HttpSource {
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(url: String, api_key: Option<String>, timeout: Duration) -> Self {
        Self { url, api_key, timeout }
    }
}

impl Source for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch(&self) -> Result<Option<DataFrame>> {
        debug!("Fetching {}", self.url);
        let client = reqwest::blocking::Client::builder().timeout(self.timeout).build()?;
        let mut request = client.get(&self.url);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        let bytes = request.send()?.error_for_status()?.bytes()?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(ParquetReader::new(Cursor::new(bytes.to_vec())).finish()?))
    }
}

/// Parquet object in S3
pub struct S3Source {
    location: S3Location,
    timeout: Duration,
}

impl S3Source {
    pub fn new(location: S3Location, timeout: Duration) -> Self {
        Self { location, timeout }
    }
}

impl Source for S3Source {
    fn name(&self) -> &str {
        "s3"
    }

    fn fetch(&self) -> Result<Option<DataFrame>> {
        let client = S3Client::from_location(&self.location, self.timeout)?;
        let bytes = client.download_object(&self.location.key)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(ParquetReader::new(Cursor::new(bytes)).finish()?))
    }
}

/// Local Parquet file
pub struct ParquetFileSource {
    path: PathBuf,
}

impl ParquetFileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Source for ParquetFileSource {
    fn name(&self) -> &str {
        "parquet"
    }

    fn fetch(&self) -> Result<Option<DataFrame>> {
        if !self.path.exists() {
            debug!("Parquet file {} does not exist", self.path.display());
            return Ok(None);
        }
        let file = File::open(&self.path)?;
        Ok(Some(ParquetReader::new(file).finish()?))
    }
}

/// Every CSV file matching a glob, concatenated in path order
pub struct CsvGlobSource {
    pattern: String,
}

impl CsvGlobSource {
    pub fn new(pattern: String) -> Self {
        Self { pattern }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matching_files(&self) -> Result<Vec<PathBuf>> {
        let entries = glob::glob(&self.pattern)
            .map_err(|e| EngineError::SourceUnavailable(format!("bad CSV pattern {}: {}", self.pattern, e)))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Skipping unreadable path: {}", e);
                    None
                }
            })
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(files)
    }
}

impl Source for CsvGlobSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn fetch(&self) -> Result<Option<DataFrame>> {
        let files = self.matching_files()?;
        if files.is_empty() {
            debug!("No CSV files match {}", self.pattern);
            return Ok(None);
        }

        let mut combined: Option<DataFrame> = None;
        for path in &files {
            let frame = match read_csv(path) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Skipping CSV {}: {}", path.display(), e);
                    continue;
                }
            };
            combined = match combined {
                None => Some(frame),
                Some(mut acc) => {
                    if acc.schema() == frame.schema() {
                        acc.vstack_mut(&frame)?;
                    } else {
                        warn!("Skipping CSV {}: columns differ from {}", path.display(), files[0].display());
                    }
                    Some(acc)
                }
            };
        }

        if let Some(df) = &combined {
            info!("Read {} rows from {} CSV file(s)", df.height(), files.len());
        }
        Ok(combined)
    }
}

fn read_csv(path: &Path) -> Result<DataFrame> {
    Ok(CsvReader::from_path(path)?.has_header(true).finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    struct Failing;

    impl Source for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn fetch(&self) -> Result<Option<DataFrame>> {
            Err(EngineError::SourceUnavailable("offline".into()))
        }
    }

    struct Fixed(DataFrame);

    impl Source for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn fetch(&self) -> Result<Option<DataFrame>> {
            Ok(Some(self.0.clone()))
        }
    }

    fn write_csv(dir: &Path, name: &str, body: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn test_acquire_falls_through_failures() {
        let df = DataFrame::new(vec![Series::new("id", &[1i64, 2])]).unwrap();
        let sources: Vec<Box<dyn Source>> = vec![
            Box::new(Failing),
            Box::new(Fixed(DataFrame::empty())),
            Box::new(Fixed(df)),
        ];
        let acquired = acquire(&sources);
        assert_eq!(acquired.source, "fixed");
        assert_eq!(acquired.frame.height(), 2);
        assert!(!acquired.persisted);
    }

    #[test]
    fn test_acquire_everything_missing_is_empty() {
        let sources: Vec<Box<dyn Source>> = vec![
            Box::new(Failing),
            Box::new(ParquetFileSource::new(PathBuf::from("/nonexistent/volta.parquet"))),
        ];
        let acquired = acquire(&sources);
        assert_eq!(acquired.frame.shape(), (0, 0));
        assert_eq!(acquired.source, "empty");
    }

    #[test]
    fn test_csv_glob_concatenates_and_skips_mismatched() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", "meterid,loc\n1,Accra\n2,Tema\n");
        write_csv(dir.path(), "b.csv", "meterid,loc\n3,Accra\n");
        write_csv(dir.path(), "c.csv", "other\nx\n");

        let pattern = format!("{}/*.csv", dir.path().display());
        let df = CsvGlobSource::new(pattern).fetch().unwrap().unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(df.get_column_names(), vec!["meterid", "loc"]);
    }

    #[test]
    fn test_csv_glob_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/*.csv", dir.path().display());
        assert!(CsvGlobSource::new(pattern).fetch().unwrap().is_none());
    }

    #[test]
    fn test_parquet_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.parquet");
        let mut df = DataFrame::new(vec![Series::new("kwh", &[1.0f64, 2.0])]).unwrap();
        let mut file = File::create(&path).unwrap();
        ParquetWriter::new(&mut file).finish(&mut df).unwrap();

        let loaded = ParquetFileSource::new(path).fetch().unwrap().unwrap();
        assert_eq!(loaded.height(), 2);
    }

    #[test]
    fn test_warehouse_source_is_persisted() {
        let wh = Warehouse::in_memory().unwrap();
        let source = WarehouseSource::new(wh.clone());
        assert!(source.is_persisted());
        assert!(source.fetch().unwrap().is_none());

        let df = DataFrame::new(vec![Series::new("id", &[1i64])]).unwrap();
        wh.replace_table(&df).unwrap();
        assert_eq!(source.fetch().unwrap().unwrap().height(), 1);
    }

    #[test]
    fn test_stalled_http_source_times_out_and_falls_through() {
        // the kernel completes the handshake; nobody ever answers
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/data.parquet", listener.local_addr().unwrap());
        let df = DataFrame::new(vec![Series::new("id", &[1i64])]).unwrap();
        let sources: Vec<Box<dyn Source>> = vec![
            Box::new(HttpSource::new(url, None, Duration::from_millis(300))),
            Box::new(Fixed(df)),
        ];

        let started = Instant::now();
        let acquired = acquire(&sources);
        assert_eq!(acquired.source, "fixed");
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        drop(listener);
    }

    #[test]
    fn test_http_not_found_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/missing.parquet", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .unwrap();
            }
        });

        let source = HttpSource::new(url.clone(), Some("key".into()), Duration::from_secs(5));
        let err = source.fetch().unwrap_err();
        assert!(matches!(err, EngineError::Http(_)));
        assert!(err.is_source_unavailable());

        let df = DataFrame::new(vec![Series::new("id", &[1i64, 2])]).unwrap();
        let sources: Vec<Box<dyn Source>> = vec![
            Box::new(HttpSource::new(url, None, Duration::from_secs(5))),
            Box::new(Fixed(df)),
        ];
        let acquired = acquire(&sources);
        assert_eq!(acquired.source, "fixed");
        assert_eq!(acquired.frame.height(), 2);
        server.join().unwrap();
    }

    #[test]
    fn test_default_chain_order() {
        let mut config = EngineConfig::default();
        config.bucket_url = Some("http://localhost:1/data.parquet".into());
        config.s3 = Some(S3Location {
            bucket: "b".into(),
            key: "k".into(),
            region: "eu-west-3".into(),
        });
        let wh = Warehouse::in_memory().unwrap();
        let names: Vec<String> = default_sources(&config, &wh).iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["warehouse", "http", "s3", "parquet", "csv"]);
    }
}
