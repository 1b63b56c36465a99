// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::net::IpAddr;
use std::path::Path;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Appends a `<addr> <hostname>` line to the hosts file at `path`.
///
/// The hypervisor resolves the migration target by the target pod's
/// hostname. Pointing that name at loopback routes its connections into the
/// local tunnels. The file must already exist.
pub async fn append_host_entry(
    path: &Path,
    addr: IpAddr,
    hostname: &str,
) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path).await?;
    file.write_all(format!("{addr} {hostname}\n").as_bytes()).await?;
    file.flush().await
}
