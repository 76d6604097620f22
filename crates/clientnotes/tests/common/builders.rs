//! Builders for creating test data programmatically.

#![allow(dead_code)]

use clientnotes::remote::Script;

/// `count` distinct clients named `Client{i:02} Family{i:02}`, which sort
/// in index order.
pub fn client_names(count: usize) -> Vec<(String, String)> {
    (1..=count)
        .map(|i| (format!("Client{:02}", i), format!("Family{:02}", i)))
        .collect()
}

/// Display name the pipeline uses for client `i` of `client_names`.
pub fn display_name(i: usize) -> String {
    format!("Family{:02}, Client{:02}", i, i)
}

/// Script exporting `count` clients.
pub fn script_with_clients(count: usize) -> Script {
    let names = client_names(count);
    let pairs: Vec<(&str, &str)> = names
        .iter()
        .map(|(first, last)| (first.as_str(), last.as_str()))
        .collect();
    Script::new().with_clients(&pairs)
}

/// Builder for configuration JSON documents.
pub struct ConfigBuilder {
    output_directory: String,
    worker_count: usize,
    extra: Vec<(String, String)>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            output_directory: "/tmp/clientnotes-out".to_string(),
            worker_count: 1,
            extra: Vec::new(),
        }
    }

    pub fn output_directory(mut self, path: &str) -> Self {
        self.output_directory = path.to_string();
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Adds a top-level section given as raw JSON.
    pub fn section(mut self, name: &str, json: &str) -> Self {
        self.extra.push((name.to_string(), json.to_string()));
        self
    }

    pub fn build(self) -> String {
        let mut fields = vec![
            r#""version": "1.0""#.to_string(),
            format!(r#""output_directory": {:?}"#, self.output_directory),
            format!(r#""worker_count": {}"#, self.worker_count),
        ];
        fields.extend(
            self.extra
                .into_iter()
                .map(|(name, json)| format!("{:?}: {}", name, json)),
        );
        format!("{{{}}}", fields.join(", "))
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
