//! tcc compiler library.
//!
//! A minimal single-pass compiler for a subset of C that emits a native
//! Windows x86-64 executable (PE32+) directly, with no external assembler
//! or linker. The parser drives the code generator as it reads tokens, so
//! machine code is produced in one pass over the source.
//!
//! ```rust
//! use tcc::compile_source;
//!
//! let image = compile_source("ret7.c", "int main() { return 7; }").unwrap();
//! assert_eq!(&image[0..2], b"MZ");
//! ```

pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod section;
pub mod symbols;
pub mod types;

pub use codegen::CodeGen;
pub use error::{CodeGenError, CompileError};
pub use lexer::Lexer;
pub use parser::Parser;

use section::SectionKind;
use std::path::Path;
use tcc_pe::{IMAGE_BASE, ImageWriter, SECTION_ALIGNMENT, align_up};

/// What kind of file to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// PE32+ executable.
    Exe,
    /// COFF relocatable object; accepted but not implemented.
    Obj,
}

/// Compile `input` and write the finished image to `output`.
///
/// Returns an error without writing anything when any diagnostic was
/// recorded during compilation.
pub fn compile_file(input: &Path, output: &Path, kind: OutputKind) -> Result<(), CompileError> {
    if kind == OutputKind::Obj {
        return Err(CompileError::Unsupported(
            "object file output (-c) is not implemented in this revision".to_string(),
        ));
    }
    tracing::debug!(input = %input.display(), "compiling");
    let lex = Lexer::from_file(input)?;
    let mut parser = Parser::new(lex);
    parser.parse();
    if parser.errors() > 0 {
        return Err(CompileError::Failed { errors: parser.errors() });
    }
    let image = build_image(&mut parser);
    std::fs::write(output, &image)?;
    tracing::debug!(output = %output.display(), bytes = image.len(), "image written");
    Ok(())
}

/// Compile in-memory source and return the serialized image.
pub fn compile_source(name: &str, source: &str) -> Result<Vec<u8>, CompileError> {
    let lex = Lexer::from_source(name, source);
    let mut parser = Parser::new(lex);
    parser.parse();
    if parser.errors() > 0 {
        return Err(CompileError::Failed { errors: parser.errors() });
    }
    Ok(build_image(&mut parser))
}

/// Lay the sections out in their fixed `.text`, `.data`, `.rdata` order,
/// resolve absolute-address immediates against the final layout, and
/// serialize the image. The entry point is the start of `main`, or the
/// start of `.text` when no `main` was defined.
fn build_image(parser: &mut Parser) -> Vec<u8> {
    let cg = &mut parser.cg;

    let mut next_rva = SECTION_ALIGNMENT;
    let mut assign = |len: usize| -> u32 {
        if len == 0 {
            return 0;
        }
        let rva = next_rva;
        next_rva += align_up(len as u32, SECTION_ALIGNMENT).max(SECTION_ALIGNMENT);
        rva
    };
    let text_rva = assign(cg.text.len());
    let data_rva = assign(cg.data.len());
    let rdata_rva = assign(cg.rdata.as_ref().map_or(0, |s| s.len()));

    cg.text.addr = IMAGE_BASE + u64::from(text_rva);
    cg.data.addr = IMAGE_BASE + u64::from(data_rva);
    if let Some(rdata) = cg.rdata.as_mut() {
        rdata.addr = IMAGE_BASE + u64::from(rdata_rva);
    }

    for i in 0..cg.addr_patches.len() {
        let (pos, section, offset) = {
            let p = &cg.addr_patches[i];
            (p.pos, p.section, p.offset)
        };
        let base = match section {
            SectionKind::Text => cg.text.addr,
            SectionKind::Data => cg.data.addr,
            SectionKind::Rdata => IMAGE_BASE + u64::from(rdata_rva),
            SectionKind::Bss => 0,
        };
        cg.text.write_u64_at(pos, base.wrapping_add(offset as u64));
    }

    let mut writer = ImageWriter::new();
    writer.set_entry_point(match parser.main_offset() {
        Some(offset) => SECTION_ALIGNMENT + offset as u32,
        None => SECTION_ALIGNMENT,
    });
    let cg = &mut parser.cg;
    writer.add_section(cg.text.name, std::mem::take(&mut cg.text.data), cg.text.flags);
    writer.add_section(cg.data.name, std::mem::take(&mut cg.data.data), cg.data.flags);
    if let Some(rdata) = cg.rdata.as_mut() {
        writer.add_section(rdata.name, std::mem::take(&mut rdata.data), rdata.flags);
    }
    writer.write()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcc_pe::ImageInfo;

    #[test]
    fn test_compile_source_minimal() {
        let image = compile_source("t.c", "int main() { return 7; }").unwrap();
        let info = ImageInfo::parse(&image).expect("valid image");
        assert_eq!(info.machine, tcc_pe::IMAGE_FILE_MACHINE_AMD64);
        assert_eq!(info.entry_point, 0x1000);
        assert_eq!(info.sections.len(), 1);
        assert_eq!(info.sections[0].name, ".text");
    }

    #[test]
    fn test_compile_errors_do_not_produce_output() {
        let err = compile_source("t.c", "int main() { return }").unwrap_err();
        assert!(matches!(err, CompileError::Failed { errors } if errors > 0));
    }

    #[test]
    fn test_object_output_is_unsupported() {
        let dir = std::env::temp_dir();
        let err = compile_file(&dir.join("missing.c"), &dir.join("missing.obj"), OutputKind::Obj)
            .unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn test_entry_point_tracks_main_offset() {
        let image =
            compile_source("t.c", "int f() { return 1; } int main() { return f(); }").unwrap();
        let info = ImageInfo::parse(&image).unwrap();
        assert!(info.entry_point > 0x1000);
    }

    #[test]
    fn test_string_patch_resolves_into_rdata() {
        let image =
            compile_source("t.c", "int main() { char *s; s = \"hi\"; return 0; }").unwrap();
        let info = ImageInfo::parse(&image).unwrap();
        let rdata = info
            .sections
            .iter()
            .find(|s| s.name == ".rdata")
            .expect("rdata present");
        let expected = IMAGE_BASE + u64::from(rdata.virtual_address);
        let text = info.section_data(&image, ".text").unwrap();
        // the absolute address of the literal appears in the code
        let needle = expected.to_le_bytes();
        assert!(text.windows(8).any(|w| w == needle));
    }

    #[test]
    fn test_data_section_follows_text() {
        let image = compile_source("t.c", "int g = 5; int main() { return g; }").unwrap();
        let info = ImageInfo::parse(&image).unwrap();
        assert_eq!(info.sections[0].name, ".text");
        assert_eq!(info.sections[1].name, ".data");
        assert!(info.sections[1].virtual_address > info.sections[0].virtual_address);
        let data = info.section_data(&image, ".data").unwrap();
        assert_eq!(&data[..4], &[5, 0, 0, 0]);
    }
}
