//! Built-in kernel set.
//!
//! Every kernel works on packed 8-bit pixels.  A node lists its input images
//! first and its output image last; all of them must share one shape.  The
//! pixel routines in [`apply`] are pure so the CPU manager and the DSP
//! firmware run exactly the same arithmetic.

use crate::graph::{KernelId, KernelNode, NodeStatus};
use crate::image::Image;

pub const NOOP: KernelId = KernelId(0);
pub const COPY: KernelId = KernelId(1);
pub const INVERT: KernelId = KernelId(2);
pub const THRESHOLD: KernelId = KernelId(3);
pub const XOR: KernelId = KernelId(4);
pub const ADD: KernelId = KernelId(5);

/// Every built-in kernel.
pub const BUILTIN: [KernelId; 6] = [NOOP, COPY, INVERT, THRESHOLD, XOR, ADD];

/// Static description of a kernel's image signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSpec {
    pub id: KernelId,
    pub name: &'static str,
    pub inputs: usize,
    pub outputs: usize,
}

impl KernelSpec {
    pub fn images(&self) -> usize {
        self.inputs + self.outputs
    }
}

pub fn describe(id: KernelId) -> Option<KernelSpec> {
    let (name, inputs, outputs) = match id {
        NOOP => ("noop", 0, 0),
        COPY => ("copy", 1, 1),
        INVERT => ("invert", 1, 1),
        THRESHOLD => ("threshold", 1, 1),
        XOR => ("xor", 2, 1),
        ADD => ("add", 2, 1),
        _ => return None,
    };
    Some(KernelSpec {
        id,
        name,
        inputs,
        outputs,
    })
}

/// Run `kernel` over packed inputs of equal length.
///
/// Returns `None` for unknown kernels, a wrong input count or mismatched
/// lengths.  [`NOOP`] yields an empty output.
pub fn apply(kernel: KernelId, inputs: &[&[u8]], value: u32) -> Option<Vec<u8>> {
    let spec = describe(kernel)?;
    if inputs.len() != spec.inputs {
        return None;
    }
    if let Some(first) = inputs.first() {
        if inputs.iter().any(|i| i.len() != first.len()) {
            return None;
        }
    }
    let level = u8::try_from(value).unwrap_or(u8::MAX);
    let out = match kernel {
        NOOP => Vec::new(),
        COPY => inputs[0].to_vec(),
        INVERT => inputs[0].iter().map(|p| !p).collect(),
        THRESHOLD => inputs[0]
            .iter()
            .map(|p| if *p > level { u8::MAX } else { 0 })
            .collect(),
        XOR => inputs[0].iter().zip(inputs[1]).map(|(a, b)| a ^ b).collect(),
        ADD => inputs[0]
            .iter()
            .zip(inputs[1])
            .map(|(a, b)| a.saturating_add(*b))
            .collect(),
        _ => return None,
    };
    Some(out)
}

/// Execute a node on the calling thread against the CPU view of its images.
pub fn execute_local(node: &KernelNode) -> NodeStatus {
    let Some(spec) = describe(node.kernel) else {
        return NodeStatus::KernelNotSupported;
    };
    if node.images.len() != spec.images() {
        return NodeStatus::InvalidParameters;
    }
    let (inputs, outputs) = node.images.split_at(spec.inputs);
    let Some(output) = outputs.first() else {
        return NodeStatus::Ok;
    };
    if !output.is_8bit() || inputs.iter().any(|i| !i.is_8bit() || !i.same_shape(output)) {
        return NodeStatus::InvalidParameters;
    }

    let pixels: Vec<Vec<u8>> = inputs.iter().map(Image::read_pixels).collect();
    let views: Vec<&[u8]> = pixels.iter().map(Vec::as_slice).collect();
    match apply(node.kernel, &views, node.value) {
        Some(out) if output.write_pixels(&out) => NodeStatus::Ok,
        _ => NodeStatus::ExecutionFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CoreType;
    use dvp_mem::{MemType, MemoryManager, PlaneLayout};

    #[test]
    fn pixel_arithmetic() {
        assert_eq!(apply(INVERT, &[&[0, 255, 10]], 0).unwrap(), vec![255, 0, 245]);
        assert_eq!(
            apply(THRESHOLD, &[&[10, 128, 200]], 128).unwrap(),
            vec![0, 0, 255]
        );
        assert_eq!(apply(XOR, &[&[0b1100], &[0b1010]], 0).unwrap(), vec![0b0110]);
        assert_eq!(apply(ADD, &[&[200, 1], &[100, 1]], 0).unwrap(), vec![255, 2]);
        assert_eq!(apply(NOOP, &[], 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn apply_rejects_bad_shapes() {
        assert!(apply(COPY, &[], 0).is_none());
        assert!(apply(XOR, &[&[1, 2], &[1]], 0).is_none());
        assert!(apply(KernelId(999), &[], 0).is_none());
    }

    #[test]
    fn names_are_stable() {
        let names: Vec<_> = BUILTIN.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, ["noop", "copy", "invert", "threshold", "xor", "add"]);
        assert_eq!(KernelId(77).to_string(), "kernel#77");
    }

    #[test]
    fn execute_local_writes_output() {
        let mem = MemoryManager::default();
        let layout = [PlaneLayout::new(4, 2, 1)];
        let src = mem.calloc(MemType::Tiled2dCached, &layout).unwrap();
        let dst = mem.calloc(MemType::Virtual, &layout).unwrap();
        let src = Image::new(src.plane(0).unwrap().clone());
        let dst = Image::new(dst.plane(0).unwrap().clone());
        src.fill(0x0f);

        let node = KernelNode::new(INVERT, CoreType::Cpu).with_images(vec![src, dst.clone()]);
        assert_eq!(execute_local(&node), NodeStatus::Ok);
        assert!(dst.read_pixels().iter().all(|p| *p == 0xf0));
    }

    #[test]
    fn execute_local_checks_parameters() {
        let mem = MemoryManager::default();
        let small = mem
            .calloc(MemType::Virtual, &[PlaneLayout::new(2, 2, 1)])
            .unwrap();
        let large = mem
            .calloc(MemType::Virtual, &[PlaneLayout::new(4, 4, 1)])
            .unwrap();
        let small = Image::new(small.plane(0).unwrap().clone());
        let large = Image::new(large.plane(0).unwrap().clone());

        let missing = KernelNode::new(COPY, CoreType::Cpu).with_images(vec![small.clone()]);
        assert_eq!(execute_local(&missing), NodeStatus::InvalidParameters);

        let mismatched = KernelNode::new(COPY, CoreType::Cpu).with_images(vec![small, large]);
        assert_eq!(execute_local(&mismatched), NodeStatus::InvalidParameters);

        let unknown = KernelNode::new(KernelId(42), CoreType::Cpu);
        assert_eq!(execute_local(&unknown), NodeStatus::KernelNotSupported);

        assert_eq!(execute_local(&KernelNode::default()), NodeStatus::Ok);
    }
}
