// Human readable dumps of an emitted method. The relocation dump lists every relocation with
// its kind name, the source location that created it, its offset from the relocatable start
// and from the method entry, and the IR node it belongs to, followed by the iterated external
// relocation groups of an AOT compilation. The snippet dump prints each snippet's label,
// address and payload. The emission summary compares the code memory that was reserved from
// the estimate with what was actually written and how much of it went to snippets.

//! Relocation, snippet and emission dumps.

use crate::aot::DecodedRecord;
use crate::codegen::CodeGenerator;
use std::fmt::{self, Write};

/// Relocation table and external groups.
pub fn relocation_dump(cg: &CodeGenerator<'_, '_>) -> String {
    let mut out = String::new();
    let _ = write_relocations(&mut out, cg);
    out
}

fn write_relocations(out: &mut String, cg: &CodeGenerator<'_, '_>) -> fmt::Result {
    cg.relocations.trace(out, &cg.buffer, &cg.instructions)?;
    let table = cg.relocations.table();
    if table.is_empty() {
        return Ok(());
    }
    writeln!(out, "External relocation groups:")?;
    for (index, group) in table.iter().enumerate() {
        write!(
            out,
            "  #{index:<3} {:<48} flags={:<10} target={:#x}",
            group.target_kind().name(),
            group.modifier_flags(),
            group.target_address()
        )?;
        if let Some(target2) = group.target_address2() {
            write!(out, " target2={target2:#x}")?;
        }
        writeln!(
            out,
            " sites={} size={}{}",
            group.number_of_relocation_sites(),
            group.size_of_relocation_data(),
            if group.is_full() { " full" } else { "" }
        )?;
    }
    Ok(())
}

/// Every snippet in insertion order.
pub fn snippet_dump(cg: &CodeGenerator<'_, '_>) -> String {
    let mut out = String::new();
    let _ = cg.snippets.print(&mut out, &cg.print_context());
    out
}

/// Reserved versus consumed code memory.
pub fn emission_summary(cg: &CodeGenerator<'_, '_>) -> String {
    let buffer = &cg.buffer;
    let snippet_bytes = cg.snippets.emitted_bytes();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}: {} bytes allocated, {} bytes used ({} unused), entry padding {}",
        cg.session().current_method().unwrap_or("<method>"),
        buffer.estimated_length(),
        buffer.actual_length(),
        buffer.estimated_length() - buffer.actual_length().min(buffer.estimated_length()),
        buffer.entry_padding()
    );
    let _ = writeln!(
        out,
        "snippets: {} emitted, {} bytes",
        cg.snippets.emitted().len(),
        snippet_bytes
    );
    out
}

/// Decoded records, one per line.
pub fn write_records(out: &mut dyn fmt::Write, records: &[DecodedRecord]) -> fmt::Result {
    let sites: usize = records.iter().map(|r| r.site_count()).sum();
    writeln!(out, "{} relocation records, {sites} sites", records.len())?;
    for (index, record) in records.iter().enumerate() {
        writeln!(out, "#{index:<3} {record}")?;
    }
    Ok(())
}
