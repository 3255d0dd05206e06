//! Table definitions served by the compute provider.

use serde_json::json;
use stratus_core::prelude::*;

/// Every compute table.
pub fn tables() -> Vec<TableDefinition> {
    vec![instances_table(), volumes_table(), regions_table()]
}

fn region_column() -> ColumnDef {
    ColumnDef::new("region", ColumnType::String, "Region the resource lives in")
        .with_transform(Transform::Scope)
        .not_null()
}

/// Display name, falling back to the resource ID.
fn display_name(record: &RawRecord) -> serde_json::Value {
    match record.get("name").and_then(|n| n.as_str()).filter(|n| !n.is_empty()) {
        Some(name) => json!(name),
        None => record.get("id").cloned().unwrap_or(serde_json::Value::Null),
    }
}

pub fn instances_table() -> TableDefinition {
    TableDefinition {
        name: "instances".to_string(),
        description: "Virtual machine instances".to_string(),
        columns: vec![
            ColumnDef::new("id", ColumnType::String, "Instance ID").not_null(),
            ColumnDef::new("name", ColumnType::String, "Instance name"),
            ColumnDef::new("title", ColumnType::String, "Name, or the ID for unnamed instances")
                .with_transform(Transform::Fn(display_name)),
            region_column(),
            ColumnDef::new("zone", ColumnType::String, "Availability zone")
                .with_transform(Transform::field("placement.zone")),
            ColumnDef::new("state", ColumnType::String, "Lifecycle state"),
            ColumnDef::new("machine_type", ColumnType::String, "Machine type")
                .with_transform(Transform::field("machineType")),
            ColumnDef::new("cpu_count", ColumnType::Int, "Virtual CPUs")
                .with_transform(Transform::field("resources.cpus")),
            ColumnDef::new("memory_gb", ColumnType::Double, "Memory in GiB")
                .with_transform(Transform::field("resources.memoryGb")),
            ColumnDef::new("image_id", ColumnType::String, "Boot image")
                .with_transform(Transform::field("imageId")),
            ColumnDef::new("public_ip", ColumnType::String, "Public IPv4 address")
                .with_transform(Transform::field("network.publicIp")),
            ColumnDef::new("private_ip", ColumnType::String, "Private IPv4 address")
                .with_transform(Transform::field("network.privateIp")),
            ColumnDef::new("is_spot", ColumnType::Bool, "Runs on preemptible capacity")
                .with_transform(Transform::field("scheduling.spot")),
            ColumnDef::new("launched_at", ColumnType::Timestamp, "Launch time")
                .with_transform(Transform::field("launchTime")),
            ColumnDef::new("labels", ColumnType::Json, "User labels"),
            ColumnDef::new("user_data", ColumnType::String, "Start-up script")
                .with_transform(Transform::hydrated("userData")),
            ColumnDef::new("security_groups", ColumnType::Json, "Attached security groups")
                .with_transform(Transform::hydrated("securityGroups")),
            ColumnDef::new("termination_protection", ColumnType::Bool, "Deletion is blocked")
                .with_transform(Transform::hydrated("terminationProtection")),
        ],
        list: ListHandler {
            kind: "instances".to_string(),
            filters: vec![
                ListFilter::equals("name", "name"),
                ListFilter::equals("state", "state"),
                ListFilter::equals("machine_type", "machineType"),
                ListFilter::equals("image_id", "imageId"),
                ListFilter::equals("zone", "zone"),
                ListFilter {
                    column: "launched_at".to_string(),
                    param: "launchTime".to_string(),
                    operators: vec![Operator::Lt, Operator::Le, Operator::Gt, Operator::Ge],
                },
            ],
        },
        get: Some(GetHandler {
            kind: "instances/{id}".to_string(),
            key_columns: vec!["id".to_string()],
        }),
        hydrate: Some(HydrateHandler {
            kind: "instances/{id}/attributes".to_string(),
            identity_columns: vec!["id".to_string()],
            policy: HydrationPolicy::EmitPartial,
        }),
        fan_out: FanOut::PerRegion,
    }
}

pub fn volumes_table() -> TableDefinition {
    TableDefinition {
        name: "volumes".to_string(),
        description: "Block storage volumes".to_string(),
        columns: vec![
            ColumnDef::new("id", ColumnType::String, "Volume ID").not_null(),
            ColumnDef::new("name", ColumnType::String, "Volume name"),
            region_column(),
            ColumnDef::new("size_gb", ColumnType::Int, "Size in GiB")
                .with_transform(Transform::field("sizeGb")),
            ColumnDef::new("volume_type", ColumnType::String, "Storage class")
                .with_transform(Transform::field("type")),
            ColumnDef::new("state", ColumnType::String, "Lifecycle state"),
            ColumnDef::new("encrypted", ColumnType::Bool, "Encrypted at rest"),
            ColumnDef::new(
                "attached_instance_id",
                ColumnType::String,
                "Instance the volume is attached to",
            )
                .with_transform(Transform::field("attachment.instanceId")),
            ColumnDef::new("created_at", ColumnType::Timestamp, "Creation time")
                .with_transform(Transform::field("createTime")),
            ColumnDef::new("kms_key_id", ColumnType::String, "Encryption key")
                .with_transform(Transform::hydrated("kmsKeyId")),
            ColumnDef::new("key_rotation_days", ColumnType::Int, "Key rotation period")
                .with_transform(Transform::hydrated("rotationPeriodDays")),
        ],
        list: ListHandler {
            kind: "volumes".to_string(),
            filters: vec![
                ListFilter::equals("volume_type", "type"),
                ListFilter::equals("encrypted", "encrypted"),
                ListFilter::equals("attached_instance_id", "instanceId"),
                ListFilter::equals("state", "state"),
            ],
        },
        get: Some(GetHandler {
            kind: "volumes/{id}".to_string(),
            key_columns: vec!["id".to_string()],
        }),
        hydrate: Some(HydrateHandler {
            kind: "volumes/{id}/encryption".to_string(),
            identity_columns: vec!["id".to_string()],
            policy: HydrationPolicy::Drop,
        }),
        fan_out: FanOut::PerRegion,
    }
}

pub fn regions_table() -> TableDefinition {
    TableDefinition {
        name: "regions".to_string(),
        description: "Regions offered by the compute API".to_string(),
        columns: vec![
            ColumnDef::new("name", ColumnType::String, "Region name").not_null(),
            ColumnDef::new("endpoint", ColumnType::String, "Regional API endpoint"),
            ColumnDef::new("status", ColumnType::String, "Availability status"),
            ColumnDef::new("zones", ColumnType::Json, "Availability zones"),
        ],
        list: ListHandler {
            kind: "regions".to_string(),
            filters: vec![ListFilter::equals("status", "status")],
        },
        get: Some(GetHandler {
            kind: "regions/{name}".to_string(),
            key_columns: vec!["name".to_string()],
        }),
        hydrate: None,
        fan_out: FanOut::Single,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_names_unique() {
        let names: HashSet<String> = tables().into_iter().map(|t| t.name).collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_filters_and_keys_refer_to_columns() {
        for table in tables() {
            for filter in &table.list.filters {
                assert!(table.has_column(&filter.column), "{}.{}", table.name, filter.column);
            }
            for key in table.key_columns() {
                assert!(table.has_column(key), "{}.{}", table.name, key);
            }
        }
    }

    #[test]
    fn test_hydrated_columns_have_handler() {
        for table in tables() {
            let hydrated = table.hydrated_columns().count();
            assert_eq!(hydrated > 0, table.hydrate.is_some(), "{}", table.name);
        }
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        assert_eq!(display_name(&json!({ "id": "i-1", "name": "web" })), json!("web"));
        assert_eq!(display_name(&json!({ "id": "i-1", "name": "" })), json!("i-1"));
        assert_eq!(display_name(&json!({ "id": "i-1" })), json!("i-1"));
    }
}
