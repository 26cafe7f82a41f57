//! Shared fixtures for the integration tests

#![allow(dead_code)]

use medcrawl::config::{Config, SourceConfig};
use serde_json::{json, Value};
use std::path::Path;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Builds a configuration with one page-numbered form source
pub fn config(server: &MockServer, db_path: &Path) -> Config {
    let text = format!(
        r#"
        [engine]
        max-retries = 3
        retry-base-delay-ms = 10
        retry-max-jitter-ms = 0
        shutdown-grace-secs = 1

        [pipeline]
        size-threshold = 5
        time-threshold-ms = 50

        [output]
        database-path = '{db}'

        [[source]]
        id = "demo"
        table = "demo_items"
        list-url = "{uri}/list"
        detail-url = "{uri}/detail"
        concurrency = 2

        [source.list]
        page-param = "pageNum"
        items-path = "data.list"
        total-pages-path = "data.pages"

        [source.detail]
        key-param = "drugId"
        items-path = "data.rows"

        [source.drug-fields]
        drug-key = "drugId"
        drug-name = "name"
        manufacturer = "factory"

        [source.detail-fields]
        hospital-name = "hospital"
        region = "area"
        "#,
        db = db_path.display(),
        uri = server.uri(),
    );
    toml::from_str(&text).expect("test config parses")
}

pub fn source(config: &Config) -> SourceConfig {
    config.sources[0].clone()
}

/// A list response holding `keys` on a listing of `pages` pages
pub fn list_body(pages: u32, keys: &[&str]) -> Value {
    let list: Vec<Value> = keys
        .iter()
        .map(|key| json!({"drugId": key, "name": format!("药品{}", key), "factory": "华南制药"}))
        .collect();
    json!({"code": 200, "data": {"pages": pages, "list": list}})
}

/// A detail response with one row per hospital
pub fn detail_body(hospitals: &[&str]) -> Value {
    let rows: Vec<Value> = hospitals
        .iter()
        .map(|name| json!({"hospital": name, "area": "广州"}))
        .collect();
    json!({"code": 200, "data": {"rows": rows}})
}

pub async fn mount_list_page(server: &MockServer, page: u32, pages: u32, keys: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/list"))
        .and(body_string_contains(format!("pageNum={}", page).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_body(pages, keys)))
        .mount(server)
        .await;
}

pub async fn mount_detail(server: &MockServer, key: &str, hospitals: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/detail"))
        .and(body_string_contains(format!("drugId={}", key).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(detail_body(hospitals)))
        .mount(server)
        .await;
}

/// Two list pages of three drugs; A1 is sold by two hospitals, every
/// other drug by one
pub async fn mount_catalog(server: &MockServer) {
    mount_list_page(server, 1, 2, &["A1", "A2", "A3"]).await;
    mount_list_page(server, 2, 2, &["B1", "B2", "B3"]).await;
    mount_detail(server, "A1", &["第一人民医院", "中山医院"]).await;
    for key in ["A2", "A3", "B1", "B2", "B3"] {
        mount_detail(server, key, &["第一人民医院"]).await;
    }
}
