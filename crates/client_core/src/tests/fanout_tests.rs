use super::*;
use anyhow::anyhow;
use messaging_transport::memory::{MemoryHub, MemoryTransport};

fn transports(kinds: &[TransportKind]) -> Vec<Arc<dyn MessagingTransport>> {
    kinds
        .iter()
        .map(|kind| MemoryTransport::new(MemoryHub::new(*kind)) as Arc<dyn MessagingTransport>)
        .collect()
}

#[tokio::test]
async fn any_policy_succeeds_when_one_transport_succeeds() {
    let transports = transports(&[TransportKind::AliyunImV2, TransportKind::RongCloud]);
    let report = fan_out("send", FanoutPolicy::Any, &transports, |transport| async move {
        if transport.kind() == TransportKind::RongCloud {
            Err(anyhow!("offline"))
        } else {
            Ok(())
        }
    })
    .await;

    assert!(report.is_success());
    assert_eq!(
        report.succeeded().collect::<Vec<_>>(),
        vec![TransportKind::AliyunImV2]
    );
    assert_eq!(report.failures().count(), 1);
}

#[tokio::test]
async fn any_policy_fails_only_when_all_fail() {
    let transports = transports(&[TransportKind::AliyunImV2, TransportKind::RongCloud]);
    let report = fan_out("send", FanoutPolicy::Any, &transports, |_| async {
        Err(anyhow!("offline"))
    })
    .await;

    let err = report.into_result().expect_err("all failed");
    let message = err.to_string();
    assert!(message.contains("aliyun_im_v2: offline"));
    assert!(message.contains("rong_cloud: offline"));
}

#[tokio::test]
async fn all_policy_fails_if_any_fails() {
    let transports = transports(&[TransportKind::AliyunImV1, TransportKind::AliyunImV2]);
    let report = fan_out("login", FanoutPolicy::All, &transports, |transport| async move {
        if transport.kind() == TransportKind::AliyunImV1 {
            Err(anyhow!("token expired"))
        } else {
            Ok(())
        }
    })
    .await;

    assert!(!report.is_success());
    assert!(matches!(report.into_result(), Err(RouterError::Fanout(_))));
}
