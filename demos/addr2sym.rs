//! Resolve an address of a process or core file to the symbol
//! describing it.

use std::env;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;

use procctl::Addr;
use procctl::AttachOpts;
use procctl::DefaultHooks;
use procctl::Process;


fn main() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();

    if args.len() != 3 {
        bail!(
            "Usage: {} <pid|core> <address>
Resolve an address in the given process or core file and print the
symbol it belongs to. Procedure linkage table entries are resolved to
the function they call.",
            args.first().map(String::as_str).unwrap_or("addr2sym")
        );
    }

    let addr_str = args[2].trim_start_matches("0x");
    let addr = Addr::from_str_radix(addr_str, 16)
        .with_context(|| format!("failed to parse address: {addr_str}"))?;

    let opts = AttachOpts {
        read_only: true,
        ..Default::default()
    };
    let process = Process::attach_arg(&args[1], opts, Arc::new(DefaultHooks))
        .with_context(|| format!("failed to attach to `{}`", args[1]))?;

    if let Some(dest) = process.pltdest(addr)? {
        println!("{addr:#x}: PLT entry for {dest}");
        return Ok(())
    }

    match process.lookup_by_address(addr) {
        Ok((object, sym)) => println!(
            "{addr:#x}: {}`{}+{:#x}",
            object.path().display(),
            sym.name,
            addr - sym.addr()
        ),
        Err(err) => println!("{addr:#x}: {err}"),
    }
    Ok(())
}
