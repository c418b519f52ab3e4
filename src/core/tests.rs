#[cfg(test)]
mod property_tests {
    use crate::core::error::Family;
    use crate::core::stack::{
        CombinedRuleManager, FILTER_CHAIN, MARK_CHAIN, NAT_CHAIN, RuleManager,
    };
    use crate::core::test_helpers::FakeFirewall;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn managers() -> (Arc<FakeFirewall>, CombinedRuleManager<FakeFirewall>) {
        let firewall = Arc::new(FakeFirewall::new());
        let rules = CombinedRuleManager::with_default_binaries(Arc::clone(&firewall));
        (firewall, rules)
    }

    /// Mark and filter rules of both families, absent chains read as empty
    fn snapshot(firewall: &FakeFirewall) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for family in [Family::V4, Family::V6] {
            for (table, chain) in [("mangle", MARK_CHAIN), ("filter", FILTER_CHAIN)] {
                out.push(firewall.rules(family, table, chain).unwrap_or_default());
            }
        }
        out
    }

    /// [`snapshot`] restricted to the rules matching `uid`
    fn snapshot_of(firewall: &FakeFirewall, uid: u32) -> Vec<Vec<String>> {
        let owner = format!("--uid-owner {uid} ");
        snapshot(firewall)
            .into_iter()
            .map(|rules| rules.into_iter().filter(|rule| rule.contains(&owner)).collect())
            .collect()
    }

    prop_compose! {
        fn arb_uid()(uid in 0u32..20_000) -> u32 {
            uid
        }
    }

    prop_compose! {
        fn arb_uids()(uids in prop::collection::vec(arb_uid(), 0..8)) -> Vec<u32> {
            uids
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_add_then_remove_restores(existing in arb_uids(), rejected in arb_uids(), uid in arb_uid()) {
            let (firewall, rules) = managers();
            block_on(async {
                rules.clear_and_add_uids(&existing).await.unwrap();
                rules.clear_and_reject_uids(&rejected).await.unwrap();
            });
            let before = snapshot_of(&firewall, uid);

            block_on(async {
                rules.add_uid(uid).await.unwrap();
                rules.remove_uid(uid).await.unwrap();
            });

            prop_assert_eq!(snapshot_of(&firewall, uid), before);
        }

        #[test]
        fn test_clear_and_add_matches_clear_then_add(existing in arb_uids(), uids in arb_uids()) {
            let (batch_fw, batch) = managers();
            let (single_fw, single) = managers();

            block_on(async {
                for rules in [&batch, &single] {
                    rules.clear_and_add_uids(&existing).await.unwrap();
                }

                batch.clear_and_add_uids(&uids).await.unwrap();

                single.clear_uids().await.unwrap();
                for &uid in &uids {
                    single.add_uid(uid).await.unwrap();
                }
            });

            for family in [Family::V4, Family::V6] {
                prop_assert_eq!(
                    batch_fw.rules(family, "mangle", MARK_CHAIN),
                    single_fw.rules(family, "mangle", MARK_CHAIN)
                );
            }
        }

        #[test]
        fn test_enable_and_cleanup_idempotent(uids in arb_uids(), masquerade in any::<bool>()) {
            let (firewall, rules) = managers();

            block_on(async {
                rules.clear_and_add_uids(&uids).await.unwrap();
                rules.enable().await.unwrap();
            });
            let once = snapshot(&firewall);
            let hooks = firewall.rules(Family::V4, "mangle", "OUTPUT");

            block_on(async {
                rules.enable().await.unwrap();
                if masquerade {
                    rules.masquerade().await.unwrap();
                }
            });
            prop_assert_eq!(snapshot(&firewall), once);
            prop_assert_eq!(firewall.rules(Family::V4, "mangle", "OUTPUT"), hooks);

            block_on(async {
                rules.cleanup().await.unwrap();
                rules.cleanup().await.unwrap();
            });
            for family in [Family::V4, Family::V6] {
                for (table, chain) in [
                    ("mangle", MARK_CHAIN),
                    ("filter", FILTER_CHAIN),
                    ("nat", NAT_CHAIN),
                ] {
                    prop_assert_eq!(firewall.rules(family, table, chain), None);
                }
            }
        }

        #[test]
        fn test_listed_uids_follow_selection(uids in arb_uids()) {
            let (_firewall, rules) = managers();

            let listed = block_on(async {
                rules.clear_and_add_uids(&uids).await.unwrap();
                rules.ipv6().list_uids().await.unwrap()
            });

            prop_assert_eq!(listed, uids);
        }
    }
}
