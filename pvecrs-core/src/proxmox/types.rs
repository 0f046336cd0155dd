//! Wire models for the Proxmox VE API.
//!
//! Several scalar fields arrive as either JSON numbers or strings
//! depending on the cluster version; the `flex_*` deserializers accept
//! both. Fields the scheduler does not consume are left unmodelled and
//! ignored during deserialization.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// Envelope every API response is wrapped in.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiData<T> {
    pub data: T,
}

/// Body of a non-2xx response.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: String,
}

/// A cluster node as listed by `GET /nodes`.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "flex_u64")]
    pub uptime: u64,
}

/// A QEMU VM as listed by `GET /nodes/{node}/qemu`.
#[derive(Debug, Clone, Deserialize)]
pub struct Vm {
    #[serde(deserialize_with = "flex_u32")]
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "flex_flag")]
    pub template: u8,
    #[serde(default)]
    pub tags: String,
    #[serde(default, deserialize_with = "flex_u64")]
    pub uptime: u64,
}

impl Vm {
    pub fn is_template(&self) -> bool {
        self.template == 1
    }
}

/// A storage entry from `GET /storage`.
#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    pub storage: String,
    #[serde(default, deserialize_with = "flex_flag")]
    pub shared: u8,
    #[serde(default)]
    pub content: String,
}

impl Storage {
    pub fn is_shared(&self) -> bool {
        self.shared == 1
    }

    /// Whether the storage qualifies for VM placement decisions: shared
    /// and able to hold disk images.
    pub fn qualifies_for_placement(&self) -> bool {
        self.is_shared()
            && self
                .content
                .split(',')
                .any(|c| matches!(c.trim(), "images" | "rootdir"))
    }
}

/// A row of the unified inventory at `GET /cluster/resources`. The list
/// is heterogeneous; `type` distinguishes nodes, VMs and storages.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub node: String,
    #[serde(default, deserialize_with = "flex_u32")]
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "flex_flag")]
    pub template: u8,
    #[serde(default)]
    pub tags: String,
    #[serde(default, deserialize_with = "flex_u64")]
    pub uptime: u64,
    /// HA manager state. Absent on versions that do not report it; a
    /// missing value means "no HA state", never "maintenance".
    #[serde(default)]
    pub hastate: Option<String>,
}

impl ClusterResource {
    pub fn ha_state(&self) -> &str {
        self.hastate.as_deref().unwrap_or("")
    }
}

/// An HA group as returned by `GET /cluster/ha/groups`.
#[derive(Debug, Clone, Deserialize)]
pub struct HaGroup {
    pub group: String,
    #[serde(default)]
    pub nodes: String,
    #[serde(default, deserialize_with = "flex_flag")]
    pub restricted: u8,
    #[serde(default, deserialize_with = "flex_flag")]
    pub nofailback: u8,
}

/// An HA resource as returned by `GET /cluster/ha/resources`.
#[derive(Debug, Clone, Deserialize)]
pub struct HaResource {
    pub sid: String,
    #[serde(default)]
    pub state: String,
    /// Last state requested through the API, reported by newer clusters.
    #[serde(default, rename = "request")]
    pub requested_state: String,
    #[serde(default)]
    pub group: String,
    #[serde(default, deserialize_with = "flex_u32")]
    pub max_relocate: u32,
    #[serde(default, deserialize_with = "flex_u32")]
    pub max_restart: u32,
    #[serde(default)]
    pub comment: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// Cluster-wide options; only the registered tag set matters here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterOptions {
    #[serde(
        default,
        rename = "registered-tags",
        deserialize_with = "flex_string_list"
    )]
    pub registered_tags: Vec<String>,
}

/// Parameters of `POST /nodes/{node}/qemu/{vmid}/migrate`.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub target: String,
    pub online: bool,
    pub with_local_disks: bool,
}

/// A VM's configuration, bucketed from the flat map the API returns.
///
/// The raw config commingles disk slots (`virtio0`, `ide2`, ...),
/// passthrough slots (`hostpci0`, ...) and scalar knobs (`scsihw`,
/// `memory`, ...). Only keys matching the slot grammar land in the
/// `disks` / `hostpci` buckets; everything else is dropped except the
/// scalars the scheduler reads.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub name: Option<String>,
    pub startup: Option<String>,
    pub disks: BTreeMap<String, String>,
    pub hostpci: BTreeMap<String, String>,
}

impl<'de> Deserialize<'de> for VmConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut config = VmConfig::default();
        for (key, value) in map {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            if crate::placement::is_disk_slot(&key) {
                config.disks.insert(key, text);
            } else if crate::placement::is_hostpci_slot(&key) {
                config.hostpci.insert(key, text);
            } else if key == "name" {
                config.name = Some(text);
            } else if key == "startup" {
                config.startup = Some(text);
            }
        }
        Ok(config)
    }
}

/// Sparse config update for `PUT /nodes/{node}/qemu/{vmid}/config`: only
/// the fields present are written. A disk slot mapped to an empty string
/// clears that slot.
#[derive(Debug, Clone, Default)]
pub struct VmConfigUpdate {
    pub startup: Option<String>,
    pub disks: BTreeMap<String, String>,
}

impl VmConfigUpdate {
    pub(crate) fn to_form(&self) -> Vec<(String, String)> {
        let mut form = Vec::new();
        if let Some(startup) = &self.startup {
            form.push(("startup".to_string(), startup.clone()));
        }
        for (slot, value) in &self.disks {
            form.push((slot.clone(), value.clone()));
        }
        form
    }
}

fn flex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlexU64;

    impl Visitor<'_> for FlexU64 {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an unsigned integer or a numeric string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("negative value {v}")))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<u64, E> {
            Ok(v as u64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid integer string {v:?}")))
        }
    }

    deserializer.deserialize_any(FlexU64)
}

fn flex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = flex_u64(deserializer)?;
    u32::try_from(value).map_err(|_| de::Error::custom(format!("value {value} out of range")))
}

/// Accepts `1`, `"1"` and `true` alike; anything else is `0`.
fn flex_flag<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlexFlag;

    impl Visitor<'_> for FlexFlag {
        type Value = u8;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a 0/1 flag as number, string or bool")
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<u8, E> {
            Ok(u8::from(v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u8, E> {
            Ok(u8::from(v != 0))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u8, E> {
            Ok(u8::from(v != 0))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u8, E> {
            Ok(u8::from(v.trim() == "1" || v.trim() == "true"))
        }
    }

    deserializer.deserialize_any(FlexFlag)
}

/// Accepts either a JSON array of strings or a single `;`/`,`-separated
/// string.
fn flex_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlexList;

    impl<'de> Visitor<'de> for FlexList {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a list of strings or a delimited string")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Vec<String>, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut out = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                out.push(item);
            }
            Ok(out)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<String>, E> {
            Ok(v.split([';', ','])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect())
        }
    }

    deserializer.deserialize_any(FlexList)
}
