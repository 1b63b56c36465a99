// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides which of a workload's disks must be copied during migration.

use std::collections::BTreeSet;

use migration_api_types::Volume;

use crate::hypervisor::DomainDisk;

/// How a workload volume is treated during migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeClass {
    /// Already consistent on both hosts; never copied.
    Shared,
    /// Generated at startup from cluster objects. Copied even when the disk
    /// is attached read-only, since the destination cannot be assumed to
    /// regenerate identical contents.
    Generated,
    Default,
}

/// The volume names of a workload, sorted into the sets that matter for
/// migration.
#[derive(Debug, Default)]
pub struct MigrationVolumes {
    shared: BTreeSet<String>,
    generated: BTreeSet<String>,
}

impl MigrationVolumes {
    pub fn classify(volumes: &[Volume]) -> Self {
        let mut classified = Self::default();
        for volume in volumes {
            if volume.source.is_shared() {
                classified.shared.insert(volume.name.clone());
            }
            if volume.source.is_generated() {
                classified.generated.insert(volume.name.clone());
            }
        }
        classified
    }

    pub fn class_of(&self, name: &str) -> VolumeClass {
        if self.shared.contains(name) {
            VolumeClass::Shared
        } else if self.generated.contains(name) {
            VolumeClass::Generated
        } else {
            VolumeClass::Default
        }
    }

    /// Returns the target devices of `disks` whose contents must be copied,
    /// in the order the disks were given.
    pub fn disk_targets(&self, disks: &[DomainDisk]) -> Vec<String> {
        disks
            .iter()
            .filter(|disk| {
                let class = self.class_of(disk.alias.as_deref().unwrap_or(""));
                if disk.read_only && class != VolumeClass::Generated {
                    return false;
                }
                matches!(disk.disk_type.as_str(), "file" | "block")
                    && class != VolumeClass::Shared
            })
            .map(|disk| disk.target_device.clone())
            .collect()
    }
}

/// Convenience wrapper for classifying `volumes` and filtering `disks` in
/// one step.
pub fn disk_targets_for_migration(
    volumes: &[Volume],
    disks: &[DomainDisk],
) -> Vec<String> {
    MigrationVolumes::classify(volumes).disk_targets(disks)
}
