//! Request protocol and command dispatch.
//!
//! Actions mirror the names the desktop shell invokes. Every command returns
//! `{ok, details?, warnings}` or `{ok: false, error: {kind, message,
//! details?}}`.

use oxidisk_engine::dispatcher::{Dispatcher, JournalResolution, OpOutcome};
use oxidisk_engine::labels::FsKind;
use oxidisk_engine::ops::geometry::{
    CopyPartitionRequest, MovePartitionRequest, ResizePartitionRequest,
};
use oxidisk_engine::ops::image::{
    BackupImageRequest, FlashImageRequest, HashImageRequest, InspectImageRequest,
};
use oxidisk_engine::ops::partition::{
    ApfsAddVolumeRequest, ApfsDeleteVolumeRequest, CheckPartitionRequest, CreatePartitionRequest,
    CreateTableRequest, DeletePartitionRequest, ForceUnmountRequest, FormatPartitionRequest,
    SetLabelUuidRequest, WipeDeviceRequest,
};
use oxidisk_engine::ops::windows::WindowsInstallRequest;
use oxidisk_engine::preflight::{OpKind, PreflightRequest};
use oxidisk_engine::size;
use oxidisk_error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct HelperRequest {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct HelperResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl HelperResponse {
    fn from_outcome(outcome: OpOutcome) -> Self {
        Self {
            ok: outcome.ok,
            details: outcome.details,
            warnings: outcome.warnings,
            error: None,
        }
    }

    fn from_value(details: Value) -> Self {
        Self {
            ok: true,
            details: Some(details),
            warnings: Vec::new(),
            error: None,
        }
    }

    fn from_error(error: &EngineError) -> Self {
        Self {
            ok: false,
            details: None,
            warnings: Vec::new(),
            error: Some(error.to_wire()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreflightPayload {
    operation: String,
    device_identifier: Option<String>,
    partition_identifier: Option<String>,
    format_type: Option<String>,
    new_size: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentifierPayload {
    #[serde(alias = "deviceIdentifier", alias = "partitionIdentifier")]
    identifier: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDisksPayload {
    #[serde(default)]
    include_system: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPayload {
    container_identifier: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalResolutionPayload {
    resolution: JournalResolution,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SudoersPayload {
    username: String,
    helper_path: String,
}

pub fn dispatch(dispatcher: &Dispatcher, request: HelperRequest) -> HelperResponse {
    match run(dispatcher, &request) {
        Ok(response) => response,
        Err(err) => HelperResponse::from_error(&err),
    }
}

fn run(dispatcher: &Dispatcher, request: &HelperRequest) -> EngineResult<HelperResponse> {
    let payload = match &request.payload {
        Value::Null => json!({}),
        other => other.clone(),
    };
    let response = match request.action.as_str() {
        "get_disks" => {
            let p: ListDisksPayload = parse(payload)?;
            let devices = dispatcher.list_devices(p.include_system)?;
            HelperResponse::from_value(serde_json::to_value(devices).unwrap_or(Value::Null))
        }
        "get_partition_devices" => {
            let devices = dispatcher.list_devices(true)?;
            HelperResponse::from_value(serde_json::to_value(devices).unwrap_or(Value::Null))
        }
        "get_partition_bounds" => {
            let p: IdentifierPayload = parse(payload)?;
            let bounds = dispatcher.partition_bounds(&p.identifier)?;
            HelperResponse::from_value(serde_json::to_value(bounds).unwrap_or(Value::Null))
        }
        "preflight_partition" => {
            let p: PreflightPayload = parse(payload)?;
            let verdict = dispatcher.preflight(build_preflight(p)?)?;
            HelperResponse::from_value(serde_json::to_value(verdict).unwrap_or(Value::Null))
        }
        "force_unmount_partition" => {
            let p: ForceUnmountRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.force_unmount(p)?)
        }
        "wipe_device" => {
            let p: WipeDeviceRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.wipe_device(p)?)
        }
        "create_partition_table" => {
            let p: CreateTableRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.create_partition_table(p)?)
        }
        "create_partition" => {
            let p: CreatePartitionRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.create_partition(p)?)
        }
        "delete_partition" => {
            let p: DeletePartitionRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.delete_partition(p)?)
        }
        "format_partition" => {
            let p: FormatPartitionRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.format_partition(p)?)
        }
        "set_label_uuid" => {
            let p: SetLabelUuidRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.set_label_uuid(p)?)
        }
        "check_partition" => {
            let p: CheckPartitionRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.check_partition(p)?)
        }
        "resize_partition" => {
            let p: ResizePartitionRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.resize_partition(p)?)
        }
        "move_partition" => {
            let p: MovePartitionRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.move_partition(p)?)
        }
        "copy_partition" => {
            let p: CopyPartitionRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.copy_partition(p)?)
        }
        "mount_disk" => {
            let p: IdentifierPayload = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.mount_disk(&p.identifier)?)
        }
        "mount_volume" => {
            let p: IdentifierPayload = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.mount_volume(&p.identifier)?)
        }
        "eject_disk" => {
            let p: IdentifierPayload = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.eject_disk(&p.identifier)?)
        }
        "apfs_list_volumes" => {
            let p: ContainerPayload = parse(payload)?;
            let container = dispatcher.apfs_list_volumes(&p.container_identifier)?;
            HelperResponse::from_value(serde_json::to_value(container).unwrap_or(Value::Null))
        }
        "apfs_add_volume" => {
            let p: ApfsAddVolumeRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.apfs_add_volume(p)?)
        }
        "apfs_delete_volume" => {
            let p: ApfsDeleteVolumeRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.apfs_delete_volume(p)?)
        }
        "inspect_image" => {
            let p: InspectImageRequest = parse(payload)?;
            let inspection = dispatcher.inspect_image(p)?;
            HelperResponse::from_value(serde_json::to_value(inspection).unwrap_or(Value::Null))
        }
        "hash_image" => {
            let p: HashImageRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.hash_image(p)?)
        }
        "flash_image" => {
            let p: FlashImageRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.flash_image(p)?)
        }
        "backup_image" => {
            let p: BackupImageRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.backup_image(p)?)
        }
        "windows_install" => {
            let p: WindowsInstallRequest = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.windows_install(p)?)
        }
        "cancel_helper_operation" => {
            dispatcher.cancel();
            HelperResponse::from_value(json!({ "cancelled": true }))
        }
        "install_sudoers_helper" => {
            let p: SudoersPayload = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.install_sudoers(&p.username, &p.helper_path)?)
        }
        "get_sidecar_status" => HelperResponse::from_value(
            serde_json::to_value(dispatcher.sidecar_status()).unwrap_or(Value::Null),
        ),
        "get_operation_journal" => {
            let pending = dispatcher.startup_journal()?;
            HelperResponse::from_value(serde_json::to_value(pending).unwrap_or(Value::Null))
        }
        "clear_operation_journal" => HelperResponse::from_outcome(dispatcher.journal_clear()?),
        "resolve_operation_journal" => {
            let p: JournalResolutionPayload = parse(payload)?;
            HelperResponse::from_outcome(dispatcher.resolve_journal(p.resolution)?)
        }
        // Shell-side conveniences; they never reach the privileged engine.
        "open_in_finder" | "move_to_trash" | "scan_directory" => {
            return Err(EngineError::Unsupported {
                reason: format!("{} is handled by the desktop shell", request.action),
            })
        }
        other => {
            return Err(EngineError::invalid(
                "action",
                format!("unknown action: {other}"),
            ))
        }
    };
    Ok(response)
}

fn build_preflight(p: PreflightPayload) -> EngineResult<PreflightRequest> {
    let operation: OpKind = serde_json::from_value(Value::String(p.operation.clone()))
        .map_err(|_| EngineError::invalid("operation", format!("unknown operation: {}", p.operation)))?;
    let target = p
        .partition_identifier
        .or(p.device_identifier)
        .ok_or_else(|| EngineError::invalid("target", "missing device identifier"))?;

    let mut request = PreflightRequest::new(operation, &target);
    if let Some(fs) = p.format_type.as_deref() {
        request = request.with_fs(FsKind::parse(fs)?);
    }
    if let Some(new_size) = p.new_size.as_deref() {
        request = request.with_new_size(size::canonical_bytes(new_size)?);
    }
    Ok(request)
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> EngineResult<T> {
    serde_json::from_value(payload)
        .map_err(|err| EngineError::invalid("payload", err.to_string()))
}
