//! Function pod construction.

use edgegrid_state::{FunctionSpec, PodPhase, PodView, Resources, labels};

use crate::error::{SchedulerError, SchedulerResult};

const SUFFIX_LEN: usize = 8;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Eight random `[a-z0-9]` characters.
pub fn random_suffix() -> SchedulerResult<String> {
    let mut bytes = [0u8; SUFFIX_LEN];
    getrandom::getrandom(&mut bytes).map_err(|e| SchedulerError::Random(e.to_string()))?;
    Ok(bytes
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect())
}

/// `<function>-<suffix>`, with `-gpu` appended for GPU pods.
pub fn pod_name(function: &str, gpu: bool) -> SchedulerResult<String> {
    let suffix = random_suffix()?;
    Ok(if gpu {
        format!("{function}-{suffix}-gpu")
    } else {
        format!("{function}-{suffix}")
    })
}

/// An unbound pod for `function`, destined for `node`.
///
/// CPU pods drop the function's GPU requests and limits.
pub fn build_pod(
    function: &FunctionSpec,
    community: &str,
    node: &str,
    gpu: bool,
) -> SchedulerResult<PodView> {
    let strip_gpu = |r: &Resources| Resources {
        gpu_memory_bytes: 0,
        vgpu: 0.0,
        ..r.clone()
    };
    let (requests, limits) = if gpu {
        (function.requests.clone(), function.limits.clone())
    } else {
        (strip_gpu(&function.requests), strip_gpu(&function.limits))
    };

    let mut pod = PodView {
        namespace: function.key.namespace.clone(),
        name: pod_name(&function.key.name, gpu)?,
        function: function.key.clone(),
        community: community.to_string(),
        node: None,
        gpu,
        phase: PodPhase::Pending,
        ready: false,
        deletion_requested: false,
        ip: None,
        port: function.port,
        image: function.image.clone(),
        env: function.env.clone(),
        requests,
        limits,
        labels: Default::default(),
        resource_version: 0,
    };
    pod.labels = labels::pod_labels(&pod);
    pod.labels.insert(labels::NODE.to_string(), node.to_string());
    Ok(pod)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_core::FunctionKey;

    fn spec() -> FunctionSpec {
        FunctionSpec {
            key: FunctionKey::new("ns", "resize"),
            image: "resize:2".into(),
            env: [("MODE".to_string(), "fast".to_string())].into(),
            port: 9000,
            requests: Resources {
                cpu_millis: 250,
                memory_bytes: 128,
                gpu_memory_bytes: 1024,
                vgpu: 0.5,
            },
            limits: Resources::default(),
            gpu: true,
            max_delay_ms: 50,
        }
    }

    #[test]
    fn suffix_is_lowercase_alphanumeric() {
        for _ in 0..32 {
            let s = random_suffix().unwrap();
            assert_eq!(s.len(), 8);
            assert!(s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn names_trace_back_to_the_function() {
        let cpu = pod_name("resize", false).unwrap();
        assert!(cpu.starts_with("resize-"));
        assert_eq!(cpu.len(), "resize-".len() + 8);

        let gpu = pod_name("resize", true).unwrap();
        assert!(gpu.starts_with("resize-") && gpu.ends_with("-gpu"));
    }

    #[test]
    fn cpu_pods_carry_no_gpu_requests() {
        let pod = build_pod(&spec(), "c-0", "node-1", false).unwrap();
        assert!(!pod.gpu);
        assert_eq!(pod.requests.gpu_memory_bytes, 0);
        assert_eq!(pod.requests.cpu_millis, 250);
        assert_eq!(pod.port, 9000);
        assert_eq!(pod.env["MODE"], "fast");
        assert!(pod.node.is_none());
    }

    #[test]
    fn pods_are_labelled_with_their_owners() {
        let pod = build_pod(&spec(), "c-0", "node-1", true).unwrap();
        assert_eq!(pod.labels[labels::FUNCTION], "resize");
        assert_eq!(pod.labels[labels::FUNCTION_NAMESPACE], "ns");
        assert_eq!(pod.labels[labels::COMMUNITY], "c-0");
        assert_eq!(pod.labels[labels::NODE], "node-1");
        assert_eq!(pod.labels[labels::GPU], "true");
        assert_eq!(pod.requests.gpu_memory_bytes, 1024);
    }
}
