// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Human-friendly rendering of registry dumps.

use crate::api::ListTnlPortsResp;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a tunnel-port dump to stdout.
pub fn print_tnl_ports(resp: &ListTnlPortsResp) -> std::io::Result<()> {
    print_tnl_ports_into(&mut std::io::stdout(), resp)
}

/// Render a tunnel-port dump as an aligned table.
pub fn print_tnl_ports_into(
    writer: impl Write,
    resp: &ListTnlPortsResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "OFPORT\tDP PORT\tNAME\tKIND\tMATCH")?;
    for port in &resp.ports {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}",
            port.ofport, port.odp_port, port.name, port.kind, port.match_key,
        )?;
    }
    t.flush()
}
