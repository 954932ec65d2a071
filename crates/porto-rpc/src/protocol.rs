//! Wire messages.
//!
//! Hand-written prost structs with explicit field tags: the schema is
//! part of the wire contract, so tags are never renumbered. A request
//! selects exactly one variant of the [`container_request::Request`]
//! union; the response always carries `(error, error_msg)` plus at
//! most one typed sub-response.

/// One client request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerRequest {
    #[prost(
        oneof = "container_request::Request",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23"
    )]
    pub request: Option<container_request::Request>,
}

pub mod container_request {
    /// The request union.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Create(super::CreateRequest),
        #[prost(message, tag = "2")]
        CreateWeak(super::CreateRequest),
        #[prost(message, tag = "3")]
        Destroy(super::DestroyRequest),
        #[prost(message, tag = "4")]
        List(super::ListRequest),
        #[prost(message, tag = "5")]
        GetProperty(super::GetPropertyRequest),
        #[prost(message, tag = "6")]
        SetProperty(super::SetPropertyRequest),
        #[prost(message, tag = "7")]
        GetData(super::GetDataRequest),
        #[prost(message, tag = "8")]
        Start(super::StartRequest),
        #[prost(message, tag = "9")]
        Stop(super::StopRequest),
        #[prost(message, tag = "10")]
        Pause(super::PauseRequest),
        #[prost(message, tag = "11")]
        Resume(super::ResumeRequest),
        #[prost(message, tag = "12")]
        Kill(super::KillRequest),
        #[prost(message, tag = "13")]
        Respawn(super::RespawnRequest),
        #[prost(message, tag = "14")]
        PropertyList(super::PropertyListRequest),
        #[prost(message, tag = "15")]
        DataList(super::DataListRequest),
        #[prost(message, tag = "16")]
        Version(super::VersionRequest),
        #[prost(message, tag = "17")]
        Wait(super::WaitRequest),
        #[prost(message, tag = "18")]
        AsyncWait(super::WaitRequest),
        #[prost(message, tag = "19")]
        CreateVolume(super::CreateVolumeRequest),
        #[prost(message, tag = "20")]
        DestroyVolume(super::DestroyVolumeRequest),
        #[prost(message, tag = "21")]
        ListVolumes(super::ListVolumesRequest),
        #[prost(message, tag = "22")]
        LinkVolume(super::LinkVolumeRequest),
        #[prost(message, tag = "23")]
        UnlinkVolume(super::UnlinkVolumeRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DestroyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRequest {
    /// Optional shell-style mask over container names.
    #[prost(string, optional, tag = "1")]
    pub mask: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPropertyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub property: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetPropertyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub property: String,
    #[prost(string, tag = "3")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDataRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub data: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Grace period override; the daemon default applies when absent.
    #[prost(uint64, optional, tag = "2")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PauseRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResumeRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub sig: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RespawnRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyListRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataListRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VersionRequest {}

/// Shared by `Wait` and `AsyncWait`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitRequest {
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
    /// Absent: wait forever. Zero: never suspend.
    #[prost(uint64, optional, tag = "2")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateVolumeRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(uint64, tag = "3")]
    pub quota: u64,
    #[prost(string, tag = "4")]
    pub flags: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DestroyVolumeRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListVolumesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinkVolumeRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub container: String,
    #[prost(string, tag = "3")]
    pub target: String,
    #[prost(bool, tag = "4")]
    pub read_only: bool,
    #[prost(bool, tag = "5")]
    pub required: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnlinkVolumeRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub container: String,
}

/// One daemon response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerResponse {
    /// Wire-stable error code; 0 is success.
    #[prost(int32, tag = "1")]
    pub error: i32,
    #[prost(string, tag = "2")]
    pub error_msg: String,
    #[prost(message, optional, tag = "3")]
    pub list: Option<ListResponse>,
    #[prost(message, optional, tag = "4")]
    pub get_property: Option<GetPropertyResponse>,
    #[prost(message, optional, tag = "5")]
    pub get_data: Option<GetDataResponse>,
    #[prost(message, optional, tag = "6")]
    pub property_list: Option<SchemaListResponse>,
    #[prost(message, optional, tag = "7")]
    pub data_list: Option<SchemaListResponse>,
    #[prost(message, optional, tag = "8")]
    pub version: Option<VersionResponse>,
    #[prost(message, optional, tag = "9")]
    pub wait: Option<WaitResponse>,
    /// Present on pushed async-wait frames only; its presence is how
    /// clients tell them apart from request replies.
    #[prost(message, optional, tag = "10")]
    pub async_wait: Option<AsyncWaitResponse>,
    #[prost(message, optional, tag = "11")]
    pub volume_list: Option<ListVolumesResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListResponse {
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPropertyResponse {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDataResponse {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SchemaEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub desc: String,
}

/// Listing of properties or data items.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SchemaListResponse {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<SchemaEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VersionResponse {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(string, tag = "2")]
    pub revision: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitResponse {
    /// Name of the container that reached a terminal state; empty on
    /// timeout.
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AsyncWaitResponse {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub state: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeDescription {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(uint64, tag = "3")]
    pub quota: u64,
    #[prost(string, tag = "4")]
    pub flags: String,
    #[prost(string, repeated, tag = "5")]
    pub containers: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListVolumesResponse {
    #[prost(message, repeated, tag = "1")]
    pub volumes: Vec<VolumeDescription>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn request_round_trips() {
        let req = ContainerRequest {
            request: Some(container_request::Request::SetProperty(
                SetPropertyRequest {
                    name: "a.b".to_string(),
                    property: "memory_limit".to_string(),
                    value: "1048576".to_string(),
                },
            )),
        };

        let bytes = req.encode_to_vec();
        let decoded = ContainerRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn response_defaults_to_empty_submessages() {
        let rsp = ContainerResponse::default();
        assert_eq!(rsp.error, 0);
        assert!(rsp.list.is_none());
        assert!(rsp.async_wait.is_none());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        // A future revision may append fields; decoding must skip them.
        let mut bytes = CreateRequest {
            name: "a".to_string(),
        }
        .encode_to_vec();
        // Field 99, varint 7: tag (99 << 3) encodes as 0x98 0x06.
        bytes.extend_from_slice(&[0x98, 0x06, 0x07]);

        let decoded = CreateRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.name, "a");
    }
}
