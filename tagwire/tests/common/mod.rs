#![allow(dead_code)]

use csv::ReaderBuilder;
use std::env;
use std::fs;
use std::path;
use tagwire::{de, Tag};

pub fn load_test_data() -> Vec<Tag> {
    let project_root = env::var("CARGO_MANIFEST_DIR").unwrap();
    let data_file = path::PathBuf::from(project_root).join("tests/resources/sample.tsv");
    let rdr = fs::File::open(data_file).unwrap();
    let mut crdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .from_reader(rdr);
    let tags = de::tsv(&mut crdr).unwrap();
    return tags;
}
