// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The extension node controller: principal control flow with a reduced
//! certificate role set, and no signing service for peers.

use super::primary::{maintain_self_authoring, prepare_self_authoring};
use super::{BootOutcome, ControllerError, RoleController};
use crate::detector::NodeKind;
use crate::monitor::MonitorCore;
use slog::Logger;
use warden_common::cluster::Role;

const OWNED_ROLES: [Role; 3] = [Role::Intermediate, Role::Monitor, Role::Web];

pub struct ExtensionController {
    log: Logger,
}

impl ExtensionController {
    pub fn new(log: &Logger) -> ExtensionController {
        ExtensionController {
            log: log.new(o!("component" => "ExtensionController")),
        }
    }
}

#[async_trait::async_trait]
impl RoleController for ExtensionController {
    fn kind(&self) -> NodeKind {
        NodeKind::Extension
    }

    fn owned_roles(&self) -> &[Role] {
        &OWNED_ROLES
    }

    async fn prepare(
        &self,
        core: &MonitorCore,
    ) -> Result<BootOutcome, ControllerError> {
        prepare_self_authoring(&self.log, core, &OWNED_ROLES).await
    }

    async fn maintain(
        &self,
        core: &MonitorCore,
    ) -> Result<(), ControllerError> {
        maintain_self_authoring(&self.log, core, &OWNED_ROLES).await
    }
}
