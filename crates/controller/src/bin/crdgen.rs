/*
 * Pod Cleanup Operator - Kubernetes controller for PodCleanupPolicy resources
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Prints the `PodCleanupPolicy` CustomResourceDefinition as YAML.

use kube::CustomResourceExt;
use pod_cleanup_controller::PodCleanupPolicy;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&PodCleanupPolicy::crd())?);
    Ok(())
}
