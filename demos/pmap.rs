//! Print the address space of a process or core file, in the manner of
//! `pmap(1)`.

use std::env;
use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;

use procctl::AttachOpts;
use procctl::DefaultHooks;
use procctl::Process;


fn main() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();

    if args.len() != 2 {
        bail!(
            "Usage: {} <pid|core>
Print the memory mappings of the given process or core file, along
with the load object each mapping belongs to.",
            args.first().map(String::as_str).unwrap_or("pmap")
        );
    }

    let opts = AttachOpts {
        read_only: true,
        no_stop: true,
        ..Default::default()
    };
    let process = Process::attach_arg(&args[1], opts, Arc::new(DefaultHooks))
        .with_context(|| format!("failed to attach to `{}`", args[1]))?;

    if let Some(psinfo) = process.psinfo() {
        println!("{}: {}", psinfo.pid, psinfo.psargs);
    }

    let mut total = 0;
    let () = process.iterate_mappings(true, |mapping, object| {
        let name = match (object, &mapping.path) {
            (Some(object), _) => object
                .canonical_path()
                .unwrap_or_else(|| object.path())
                .display()
                .to_string(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => "[ anon ]".to_string(),
        };
        println!(
            "{:016x} {:>8}K {:?}  {name}",
            mapping.base,
            mapping.size / 1024,
            mapping.perm
        );
        total += mapping.size;
        ControlFlow::Continue(())
    })?;
    println!(" total {:>16}K", total / 1024);
    Ok(())
}
