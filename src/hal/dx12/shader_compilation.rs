use windows::{core::*, Win32::Graphics::Direct3D::Dxc::*};

use super::HResult as _;
use crate::{
    error::{Error, Result},
    hal,
};

const CP_UTF8: u32 = 65001;

/// DXC compiler instance, loaded from `dxcompiler.dll` on first use.
pub struct DxcContainer {
    compiler: IDxcCompiler3,
}

impl DxcContainer {
    pub fn new() -> Result<Self> {
        let compiler: IDxcCompiler3 = unsafe { DxcCreateInstance(&CLSID_DxcCompiler) }
            .into_device_result("DxcCreateInstance")?;
        log::debug!("Loaded DXC compiler");
        Ok(Self { compiler })
    }

    /// Compile one HLSL library. Errors carry the compiler's diagnostic text.
    pub fn compile(&self, desc: &hal::ShaderLibraryDescriptor) -> Result<IDxcBlob> {
        let source_name = HSTRING::from(desc.source_name);
        let profile = HSTRING::from(desc.target_profile);
        let mut arguments = vec![PCWSTR::from(&source_name), w!("-T"), PCWSTR::from(&profile)];
        if cfg!(debug_assertions) {
            arguments.push(w!("-Zi"));
            arguments.push(w!("-Qembed_debug"));
        }

        let buffer = DxcBuffer {
            Ptr: desc.source.as_ptr() as _,
            Size: desc.source.len(),
            Encoding: CP_UTF8,
        };
        let result: IDxcOperationResult = unsafe {
            self.compiler
                .Compile(&buffer, Some(&arguments), None::<&IDxcIncludeHandler>)
        }
        .map_err(|err| Error::ShaderCompilation {
            stage: desc.label.to_string(),
            log: err.to_string(),
        })?;

        let status = unsafe { result.GetStatus() }.into_device_result("GetStatus")?;
        if status.is_err() {
            let log = unsafe { result.GetErrorBuffer() }
                .ok()
                .and_then(|errors| errors.cast::<IDxcBlob>().ok())
                .map(|errors| unsafe {
                    let bytes = std::slice::from_raw_parts(
                        errors.GetBufferPointer() as *const u8,
                        errors.GetBufferSize(),
                    );
                    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
                })
                .unwrap_or_else(|| format!("{}", status.message()));
            return Err(Error::ShaderCompilation {
                stage: desc.label.to_string(),
                log,
            });
        }

        let blob = unsafe { result.GetResult() }.into_device_result("GetResult")?;
        log::info!(
            "Compiled {} library `{}` ({} bytes)",
            desc.label,
            desc.source_name,
            unsafe { blob.GetBufferSize() }
        );
        Ok(blob)
    }
}
