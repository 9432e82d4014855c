//! Claim descriptors
//!
//! A `ClaimDescriptor` is the saga's transport value for a
//! PersistentVolumeClaim: the fields needed to recreate the claim, detached
//! from the live API object (no uid, resourceVersion, or status).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use pvscope_common::Error;

/// Suffix appended to the original claim name for the staging claim
pub const STAGING_SUFFIX: &str = "-staging";

/// Phase reported by a claim once it is bound to a volume
pub const PHASE_BOUND: &str = "Bound";

/// Resource key for storage requests and limits
pub const RESOURCE_STORAGE: &str = "storage";

/// Maximum length of a claim name (DNS subdomain)
const MAX_CLAIM_NAME_LEN: usize = 253;

/// Annotation prefixes written by the binding controller and provisioners.
/// Copying them onto a new claim makes the controller treat it as already bound.
const BINDING_ANNOTATION_PREFIXES: &[&str] = &[
    "pv.kubernetes.io/",
    "volume.kubernetes.io/",
    "volume.beta.kubernetes.io/",
];

/// Storage claim independent of the live cluster object
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDescriptor {
    /// Claim name
    pub name: String,
    /// Claim namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations, minus binding-controller bookkeeping
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Volume the claim is bound to.
    ///
    /// Read from a live claim this is only set once the claim is Bound. On a
    /// descriptor that has not been created yet it pins the volume the new
    /// claim must bind to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_name: Option<String>,
    /// Storage class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Access modes (e.g. `ReadWriteOnce`)
    #[serde(default)]
    pub access_modes: Vec<String>,
    /// Requested storage quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_size: Option<String>,
    /// Storage limit quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_size: Option<String>,
}

impl ClaimDescriptor {
    /// Build a descriptor from a live claim
    pub fn from_claim(claim: &PersistentVolumeClaim) -> Result<Self, Error> {
        let name = claim
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("claim has no name"))?;
        let spec = claim.spec.clone().unwrap_or_default();

        let bound = claim
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some(PHASE_BOUND);
        let bound_volume_name = spec
            .volume_name
            .clone()
            .filter(|v| bound && !v.is_empty());

        let resources = spec.resources.unwrap_or_default();
        let storage_of = |list: Option<BTreeMap<String, Quantity>>| {
            list.and_then(|l| l.get(RESOURCE_STORAGE).map(|q| q.0.clone()))
        };

        Ok(Self {
            name,
            namespace: claim.metadata.namespace.clone().unwrap_or_default(),
            labels: claim.metadata.labels.clone().unwrap_or_default(),
            annotations: strip_binding_annotations(
                claim.metadata.annotations.clone().unwrap_or_default(),
            ),
            bound_volume_name,
            storage_class_name: spec.storage_class_name,
            access_modes: spec.access_modes.unwrap_or_default(),
            requested_size: storage_of(resources.requests),
            limit_size: storage_of(resources.limits),
        })
    }

    /// Build the claim object to submit for this descriptor
    pub fn to_claim(&self) -> PersistentVolumeClaim {
        let storage = |size: &Option<String>| {
            size.as_ref().map(|s| {
                BTreeMap::from([(RESOURCE_STORAGE.to_string(), Quantity(s.clone()))])
            })
        };

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
                annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: (!self.access_modes.is_empty()).then(|| self.access_modes.clone()),
                storage_class_name: self.storage_class_name.clone(),
                volume_name: self.bound_volume_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: storage(&self.requested_size),
                    limits: storage(&self.limit_size),
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Name of the bound volume, or `MissingState` if the claim never bound
    pub fn bound_volume(&self) -> Result<&str, Error> {
        self.bound_volume_name
            .as_deref()
            .ok_or_else(|| Error::missing_state(format!("bound volume of claim {}", self.name)))
    }

    /// Name of the staging claim for this claim
    pub fn staging_name(&self) -> String {
        format!("{}{}", self.name, STAGING_SUFFIX)
    }

    /// Staging descriptor: same metadata, staging name, new size, unbound
    pub fn staging_for(&self, target_size: &str, storage_class: Option<&str>) -> Self {
        Self {
            name: self.staging_name(),
            bound_volume_name: None,
            ..self.resized(target_size, storage_class)
        }
    }

    /// Descriptor reusing this claim's name and metadata, pinned to `volume`
    pub fn rebound_to(&self, volume: &str, target_size: &str, storage_class: Option<&str>) -> Self {
        Self {
            bound_volume_name: Some(volume.to_string()),
            ..self.resized(target_size, storage_class)
        }
    }

    fn resized(&self, target_size: &str, storage_class: Option<&str>) -> Self {
        Self {
            storage_class_name: storage_class
                .map(str::to_string)
                .or_else(|| self.storage_class_name.clone()),
            requested_size: Some(target_size.to_string()),
            limit_size: Some(target_size.to_string()),
            ..self.clone()
        }
    }
}

/// Drop annotations that belong to the binding controller or provisioner
pub fn strip_binding_annotations(
    annotations: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    annotations
        .into_iter()
        .filter(|(k, _)| !BINDING_ANNOTATION_PREFIXES.iter().any(|p| k.starts_with(p)))
        .collect()
}

/// Validate a claim name leaves room for the staging suffix
pub fn validate_claim_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::validation("claim name must not be empty"));
    }
    if name.len() + STAGING_SUFFIX.len() > MAX_CLAIM_NAME_LEN {
        return Err(Error::validation(format!(
            "claim name {} is too long to derive a staging name",
            name
        )));
    }
    Ok(())
}

/// Validate a storage quantity such as `5Gi`, `500M`, or `1.5Ti`
///
/// Accepts a positive decimal number followed by an optional binary
/// (`Ki`..`Ei`) or decimal (`k`, `M`..`E`) suffix, or a decimal exponent.
pub fn validate_size(size: &str) -> Result<(), Error> {
    quantity_bytes(size).map(|_| ())
}

/// Bytes denoted by a storage quantity
///
/// The API server may rewrite a quantity into canonical form (`1.5Gi`
/// comes back as `1536Mi`), so sizes are compared by value, not by text.
pub fn quantity_bytes(size: &str) -> Result<f64, Error> {
    let invalid = || Error::validation(format!("invalid storage size: {:?}", size));

    let split = size
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size.len());
    let (number, suffix) = size.split_at(split);

    if number.is_empty() || number.matches('.').count() > 1 || number.ends_with('.') {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;
    if value <= 0.0 {
        return Err(invalid());
    }

    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        s if s.starts_with('e') || s.starts_with('E') => {
            let exp = &s[1..];
            if exp.is_empty() || !exp.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            let exp: i32 = exp.parse().map_err(|_| invalid())?;
            10f64.powi(exp)
        }
        _ => return Err(invalid()),
    };
    Ok(value * multiplier)
}

fn same_size(a: &str, b: &str) -> bool {
    match (quantity_bytes(a), quantity_bytes(b)) {
        (Ok(a), Ok(b)) => (a - b).abs() <= a.max(b) * 1e-9,
        _ => a == b,
    }
}

impl ClaimDescriptor {
    /// Why this live claim cannot stand in for `intended`, if it cannot
    ///
    /// Compares the requested size and, when `intended` names one, the
    /// storage class.
    pub fn mismatch_with(&self, intended: &ClaimDescriptor) -> Option<String> {
        match (&self.requested_size, &intended.requested_size) {
            (Some(have), Some(want)) if !same_size(have, want) => {
                return Some(format!("requests {} instead of {}", have, want));
            }
            (None, Some(want)) => return Some(format!("requests no size instead of {}", want)),
            _ => {}
        }
        if intended.storage_class_name.is_some()
            && self.storage_class_name != intended.storage_class_name
        {
            return Some(format!(
                "has storage class {} instead of {}",
                self.storage_class_name.as_deref().unwrap_or("<none>"),
                intended.storage_class_name.as_deref().unwrap_or_default()
            ));
        }
        None
    }
}
