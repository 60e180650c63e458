//! Shader binding table.
//!
//! Layout: `[ray-gen][miss ...][hit ...]`, every record the same size so each
//! sub-table can be walked with one stride. A record is the program's shader
//! identifier followed by its inputs, 8 bytes each, zero padded.

use crate::{
    error::{Error, Result},
    hal::{
        align_to, Api, DispatchRaysDesc, GpuAddress, GpuAddressRange, GpuAddressRangeAndStride,
        GpuDescriptorHandle, ShaderIdentifier, SHADER_IDENTIFIER_SIZE, SHADER_RECORD_ALIGNMENT,
        SHADER_TABLE_ALIGNMENT,
    },
    pipeline::RayTracingPipeline,
    upload::UploadBuffer,
};

pub const INPUT_SIZE: u64 = 8;

/// One 8-byte record input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingValue {
    /// Root SRV, UAV or CBV.
    GpuAddress(GpuAddress),
    /// Start of a descriptor table.
    DescriptorHandle(GpuDescriptorHandle),
    /// Two packed 32-bit root constants.
    RawConstant(u64),
}

impl BindingValue {
    pub fn to_bits(self) -> u64 {
        match self {
            Self::GpuAddress(address) => address,
            Self::DescriptorHandle(handle) => handle.0,
            Self::RawConstant(value) => value,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderRecord {
    pub export: String,
    pub inputs: Vec<BindingValue>,
}

impl ShaderRecord {
    pub fn new(export: &str, inputs: Vec<BindingValue>) -> Self {
        Self {
            export: export.to_string(),
            inputs,
        }
    }
}

/// Sizes and offsets of a table, relative to its start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderTableLayout {
    pub record_size: u64,
    pub miss_count: u32,
    pub hit_count: u32,
    pub table_size: u64,
}

impl ShaderTableLayout {
    /// Records are sized for the largest input list. The size is rounded to
    /// the record alignment (32) and then to the table alignment (64): the
    /// stride doubles as the sub-table offset, so the miss and hit tables only
    /// start on a table boundary if every record is a multiple of 64. A record
    /// with no inputs is therefore 64 bytes, not 32.
    pub fn compute(max_input_count: usize, miss_count: u32, hit_count: u32) -> Self {
        let unaligned = SHADER_IDENTIFIER_SIZE + INPUT_SIZE * max_input_count as u64;
        let record_size = align_to(
            align_to(unaligned, SHADER_RECORD_ALIGNMENT),
            SHADER_TABLE_ALIGNMENT,
        );
        let record_count = 1 + u64::from(miss_count) + u64::from(hit_count);
        Self {
            record_size,
            miss_count,
            hit_count,
            table_size: align_to(record_size * record_count, SHADER_TABLE_ALIGNMENT),
        }
    }

    pub fn record_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    pub fn miss_offset(&self) -> u64 {
        self.record_size
    }

    pub fn hit_offset(&self) -> u64 {
        self.record_size * (1 + u64::from(self.miss_count))
    }

    /// Offset of hit record `index`.
    pub fn hit_record_offset(&self, index: u32) -> u64 {
        self.hit_offset() + self.record_size * u64::from(index)
    }

    pub fn dispatch_desc(&self, base: GpuAddress, width: u32, height: u32) -> DispatchRaysDesc {
        DispatchRaysDesc {
            ray_generation: GpuAddressRange {
                start_address: base,
                size: self.record_size,
            },
            miss: GpuAddressRangeAndStride {
                start_address: base + self.miss_offset(),
                size: self.record_size * u64::from(self.miss_count),
                stride: self.record_size,
            },
            hit_group: GpuAddressRangeAndStride {
                start_address: base + self.hit_offset(),
                size: self.record_size * u64::from(self.hit_count),
                stride: self.record_size,
            },
            callable: GpuAddressRangeAndStride::default(),
            width,
            height,
            depth: 1,
        }
    }
}

/// Logical records waiting to be laid out.
#[derive(Clone, Debug, Default)]
pub struct ShaderBindingTableBuilder {
    ray_generation: Option<ShaderRecord>,
    miss: Vec<ShaderRecord>,
    hit: Vec<ShaderRecord>,
}

impl ShaderBindingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// There is exactly one ray-generation record; a second call replaces it.
    pub fn add_ray_generation_program(&mut self, export: &str, inputs: Vec<BindingValue>) {
        if let Some(ref previous) = self.ray_generation {
            log::warn!(
                "Replacing ray-generation record `{}` with `{}`",
                previous.export,
                export
            );
        }
        self.ray_generation = Some(ShaderRecord::new(export, inputs));
    }

    pub fn add_miss_program(&mut self, export: &str, inputs: Vec<BindingValue>) {
        self.miss.push(ShaderRecord::new(export, inputs));
    }

    /// Call once per instance, in instance order.
    pub fn add_hit_program(&mut self, export: &str, inputs: Vec<BindingValue>) {
        self.hit.push(ShaderRecord::new(export, inputs));
    }

    /// Drop every record, ray-generation included.
    pub fn clear(&mut self) {
        self.ray_generation = None;
        self.miss.clear();
        self.hit.clear();
    }

    pub fn hit_records(&self) -> &[ShaderRecord] {
        &self.hit
    }

    fn records(&self) -> impl Iterator<Item = &ShaderRecord> {
        self.ray_generation
            .iter()
            .chain(self.miss.iter())
            .chain(self.hit.iter())
    }

    pub fn max_input_count(&self) -> usize {
        self.records()
            .map(|record| record.inputs.len())
            .max()
            .unwrap_or(0)
    }

    pub fn layout(&self) -> Result<ShaderTableLayout> {
        if self.ray_generation.is_none() {
            return Err(Error::MissingRayGeneration);
        }
        Ok(ShaderTableLayout::compute(
            self.max_input_count(),
            self.miss.len() as u32,
            self.hit.len() as u32,
        ))
    }

    /// Byte image of the table. Padding is always zero.
    pub fn serialize<F>(&self, identifier: F) -> Result<(ShaderTableLayout, Vec<u8>)>
    where
        F: Fn(&str) -> Result<ShaderIdentifier>,
    {
        let layout = self.layout()?;
        let mut bytes = vec![0u8; layout.table_size as usize];
        for (record, chunk) in self
            .records()
            .zip(bytes.chunks_exact_mut(layout.record_size as usize))
        {
            let id = identifier(&record.export)?;
            let (head, tail) = chunk.split_at_mut(SHADER_IDENTIFIER_SIZE as usize);
            head.copy_from_slice(&id.0);
            for (input, slot) in record
                .inputs
                .iter()
                .zip(tail.chunks_exact_mut(INPUT_SIZE as usize))
            {
                slot.copy_from_slice(&input.to_bits().to_le_bytes());
            }
        }
        Ok((layout, bytes))
    }

    /// Lay out the records into a fresh upload buffer and derive the dispatch
    /// for a `width` x `height` grid. Every record must carry exactly the
    /// inputs its export's local root signature declares.
    pub fn build<A: Api>(
        &self,
        device: &A::Device,
        pipeline: &RayTracingPipeline<A>,
        width: u32,
        height: u32,
    ) -> Result<ShaderBindingTable<A>> {
        for record in self.records() {
            if let Some(expected) = pipeline.record_input_count(&record.export) {
                if record.inputs.len() != expected {
                    return Err(Error::RecordInputMismatch {
                        export: record.export.clone(),
                        expected,
                        found: record.inputs.len(),
                    });
                }
            }
        }
        let (layout, bytes) = self.serialize(|export| pipeline.shader_identifier(export))?;
        let buffer = UploadBuffer::with_data(device, "shader binding table", &bytes)?;
        let dispatch = layout.dispatch_desc(buffer.gpu_address(), width, height);
        log::debug!(
            "Built shader binding table: {} records of {} bytes, {} bytes total",
            layout.record_count(),
            layout.record_size,
            layout.table_size
        );
        Ok(ShaderBindingTable {
            buffer,
            layout,
            dispatch,
        })
    }
}

pub struct ShaderBindingTable<A: Api> {
    buffer: UploadBuffer<A>,
    layout: ShaderTableLayout,
    dispatch: DispatchRaysDesc,
}

impl<A: Api> ShaderBindingTable<A> {
    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    pub fn dispatch_desc(&self) -> &DispatchRaysDesc {
        &self.dispatch
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.buffer.gpu_address()
    }

    pub fn record_count(&self) -> u32 {
        self.layout.record_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_identifier(export: &str) -> Result<ShaderIdentifier> {
        let mut id = [0u8; SHADER_IDENTIFIER_SIZE as usize];
        for (slot, byte) in id.iter_mut().zip(export.bytes().cycle()) {
            *slot = byte;
        }
        Ok(ShaderIdentifier(id))
    }

    fn builder(hit_count: usize) -> ShaderBindingTableBuilder {
        let mut builder = ShaderBindingTableBuilder::new();
        builder.add_ray_generation_program(
            "RayGen",
            vec![BindingValue::DescriptorHandle(GpuDescriptorHandle(0xabc0))],
        );
        builder.add_miss_program("Miss", Vec::new());
        for i in 0..hit_count as u64 {
            builder.add_hit_program(
                "HitGroup",
                vec![
                    BindingValue::GpuAddress(0x1000 * (i + 1)),
                    BindingValue::GpuAddress(0x9000),
                    BindingValue::RawConstant(i),
                ],
            );
        }
        builder
    }

    #[test]
    fn record_size_covers_the_largest_record() {
        for k in 0..12 {
            let layout = ShaderTableLayout::compute(k, 1, 3);
            assert!(layout.record_size >= SHADER_IDENTIFIER_SIZE + 8 * k as u64);
            assert_eq!(layout.record_size % SHADER_RECORD_ALIGNMENT, 0);
            assert_eq!(layout.table_size % SHADER_TABLE_ALIGNMENT, 0);
            assert_eq!(layout.hit_offset() % SHADER_TABLE_ALIGNMENT, 0);
            assert!(layout.table_size >= layout.record_size * 5);
        }
        assert_eq!(ShaderTableLayout::compute(0, 1, 0).record_size, 64);
    }

    #[test]
    fn offsets_follow_record_order() {
        let layout = ShaderTableLayout::compute(4, 2, 3);
        assert_eq!(layout.record_size, 64);
        assert_eq!(layout.miss_offset(), 64);
        assert_eq!(layout.hit_offset(), 192);
        assert_eq!(layout.hit_record_offset(2), 320);
        assert_eq!(layout.table_size, 384);

        let dispatch = layout.dispatch_desc(0x4000, 800, 600);
        assert_eq!(dispatch.ray_generation.size, 64);
        assert_eq!(dispatch.miss.start_address, 0x4040);
        assert_eq!(dispatch.miss.size, 128);
        assert_eq!(dispatch.hit_group.start_address, 0x4000 + 192);
        assert_eq!(dispatch.hit_group.stride, 64);
        assert_eq!((dispatch.width, dispatch.height, dispatch.depth), (800, 600, 1));
    }

    #[test]
    fn serialize_writes_identifier_then_inputs() {
        let (layout, bytes) = builder(2).serialize(fake_identifier).unwrap();
        assert_eq!(layout.record_count(), 4);

        let ray_gen = &bytes[..layout.record_size as usize];
        assert_eq!(&ray_gen[..32], &fake_identifier("RayGen").unwrap().0);
        assert_eq!(&ray_gen[32..40], &0xabc0u64.to_le_bytes());
        assert!(ray_gen[40..].iter().all(|&b| b == 0));

        let miss = &bytes[layout.miss_offset() as usize..layout.hit_offset() as usize];
        assert!(miss[32..].iter().all(|&b| b == 0));

        let second_hit = layout.hit_record_offset(1) as usize;
        assert_eq!(
            &bytes[second_hit + 32..second_hit + 40],
            &0x2000u64.to_le_bytes()
        );
        assert_eq!(
            &bytes[second_hit + 40..second_hit + 48],
            &0x9000u64.to_le_bytes()
        );
        assert_eq!(&bytes[second_hit + 48..second_hit + 56], &1u64.to_le_bytes());
    }

    #[test]
    fn miss_records_keep_registration_order() {
        let mut builder = builder(1);
        builder.add_miss_program("ShadowMiss", vec![BindingValue::RawConstant(0x5)]);
        let (layout, bytes) = builder.serialize(fake_identifier).unwrap();
        assert_eq!(layout.miss_count, 2);
        assert_eq!(layout.record_count(), 4);
        assert_eq!(layout.hit_offset(), 3 * layout.record_size);

        let record = |offset: u64| &bytes[offset as usize..(offset + layout.record_size) as usize];
        let first = record(layout.miss_offset());
        assert_eq!(&first[..32], &fake_identifier("Miss").unwrap().0);
        assert!(first[32..].iter().all(|&b| b == 0));

        let second = record(layout.miss_offset() + layout.record_size);
        assert_eq!(&second[..32], &fake_identifier("ShadowMiss").unwrap().0);
        assert_eq!(&second[32..40], &0x5u64.to_le_bytes());
        assert!(second[40..].iter().all(|&b| b == 0));

        let hit = record(layout.hit_record_offset(0));
        assert_eq!(&hit[..32], &fake_identifier("HitGroup").unwrap().0);
        assert_eq!(&hit[32..40], &0x1000u64.to_le_bytes());

        let dispatch = layout.dispatch_desc(0, 1, 1);
        assert_eq!(dispatch.miss.size, 2 * layout.record_size);
        assert_eq!(dispatch.hit_group.start_address, layout.hit_offset());
    }

    #[test]
    fn serialize_is_idempotent() {
        let builder = builder(3);
        let first = builder.serialize(fake_identifier).unwrap();
        let second = builder.serialize(fake_identifier).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_hit_records_still_cover_ray_gen_and_miss() {
        let (layout, bytes) = builder(0).serialize(fake_identifier).unwrap();
        assert_eq!(layout.hit_count, 0);
        assert_eq!(layout.record_count(), 2);
        assert!(layout.table_size >= 2 * layout.record_size);
        assert_eq!(bytes.len() as u64, layout.table_size);
        assert_eq!(layout.dispatch_desc(0, 1, 1).hit_group.size, 0);
    }

    #[test]
    fn ray_gen_is_required() {
        let mut builder = builder(1);
        builder.clear();
        assert!(builder.hit_records().is_empty());
        assert!(matches!(
            builder.serialize(fake_identifier),
            Err(Error::MissingRayGeneration)
        ));
    }

    #[test]
    fn unknown_exports_fail() {
        let builder = builder(1);
        let err = builder
            .serialize(|export| match export {
                "HitGroup" => Err(Error::MissingShaderIdentifier(export.to_string())),
                _ => fake_identifier(export),
            })
            .unwrap_err();
        assert!(matches!(err, Error::MissingShaderIdentifier(_)));
    }

    #[test]
    fn build_checks_inputs_against_root_signatures() {
        use crate::hal::{headless, DescriptorRange, DescriptorRangeKind, RootParameter};
        use crate::pipeline::{RayTracingPipelineSettings, ShaderSources};

        let device = headless::Device::new();
        let settings = RayTracingPipelineSettings {
            ray_gen_parameters: vec![RootParameter::DescriptorTable(vec![DescriptorRange::new(
                DescriptorRangeKind::Uav,
                1,
                0,
            )])],
            hit_parameters: vec![RootParameter::srv(0), RootParameter::srv(1), RootParameter::cbv(0)],
            ..Default::default()
        };
        let pipeline =
            RayTracingPipeline::<headless::Api>::build(&device, &ShaderSources::builtin(), settings)
                .unwrap();

        let table = builder(2).build(&device, &pipeline, 16, 16).unwrap();
        assert_eq!(table.record_count(), 4);

        let mut short = builder(0);
        short.add_hit_program("HitGroup", vec![BindingValue::GpuAddress(0x1000)]);
        match short.build(&device, &pipeline, 16, 16) {
            Err(Error::RecordInputMismatch {
                export,
                expected,
                found,
            }) => {
                assert_eq!(export, "HitGroup");
                assert_eq!((expected, found), (3, 1));
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("table built with a short hit record"),
        }
    }

    #[test]
    fn binding_values_serialize_as_raw_bits() {
        assert_eq!(BindingValue::GpuAddress(7).to_bits(), 7);
        assert_eq!(
            BindingValue::DescriptorHandle(GpuDescriptorHandle(9)).to_bits(),
            9
        );
        assert_eq!(BindingValue::RawConstant(u64::MAX).to_bits(), u64::MAX);
    }
}
