//! Conversion between pipeline tags and SDK tag types
//!
//! Tag keys and values are defined in [`rds_sanitizer_common::tags`].

use std::collections::HashMap;

use rds_sanitizer_common::tags::{TAG_RUN_ID, TAG_TOOL, TAG_TOOL_VALUE};

use crate::pipeline::Tags;

/// Build RDS tags from key/value pairs
pub fn rds_tags(tags: &Tags) -> Vec<aws_sdk_rds::types::Tag> {
    tags.iter()
        .map(|(k, v)| aws_sdk_rds::types::Tag::builder().key(k).value(v).build())
        .collect()
}

/// Read RDS tags back into key/value pairs, dropping incomplete entries
pub fn from_rds_tags(tags: &[aws_sdk_rds::types::Tag]) -> Tags {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect()
}

/// Tags for the sanitizer task, so stray tasks are traceable to their run
pub fn ecs_tags(run_id: &str) -> Vec<aws_sdk_ecs::types::Tag> {
    [(TAG_TOOL, TAG_TOOL_VALUE), (TAG_RUN_ID, run_id)]
        .into_iter()
        .map(|(k, v)| aws_sdk_ecs::types::Tag::builder().key(k).value(v).build())
        .collect()
}

pub fn tag_map(tags: &Tags) -> HashMap<String, String> {
    tags.iter().cloned().collect()
}
