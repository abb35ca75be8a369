//! SMF manifests for the `esrep-sync` service.
//!
//! The bundle declares the service and its start method; each replication
//! pair is an instance carrying its `esrep/*` properties. The start method's
//! argument order is relied upon by `esrep-sync.sh`.

use std::fmt::Write;

pub const SERVICE_BASE_NAME: &str = "esrep-sync";
pub const SERVICE_NAME: &str = "application/esrep-sync";

pub fn instance_name(slave_uuid: &str) -> String {
    format!("slave-{slave_uuid}")
}

pub fn instance_fmri(slave_uuid: &str) -> String {
    format!("svc:/{SERVICE_NAME}:{}", instance_name(slave_uuid))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleManifest {
    pub erigones_home: String,
    pub path: String,
    pub python_path: String,
    /// Program started by the service (`esrep-sync.sh`).
    pub sync_bin: String,
}

impl BundleManifest {
    pub fn render(&self) -> String {
        let home = xml_escape(&self.erigones_home);
        let mut xml = String::new();
        header(&mut xml);
        let _ = write!(
            xml,
            r"    <service name='{SERVICE_NAME}' type='service' version='0'>
        <dependency name='network' grouping='require_all' restart_on='none' type='service'>
            <service_fmri value='svc:/application/erigonesd:fast'/>
        </dependency>

        <method_context working_directory='{home}/var/run'>
            <method_credential user='root' group=':default' />
            <method_environment>
                <envvar name='ERIGONES_HOME' value='{home}' />
                <envvar name='PATH' value='{path}' />
                <envvar name='PYTHONPATH' value='{python_path}' />
                <envvar name='VIRTUAL_ENV' value='{home}/envs' />
            </method_environment>
        </method_context>

        <exec_method type='method' name='start' exec='{bin} sync -q -m %{{esrep/master}} -s %{{esrep/slave}} -H %{{esrep/master_host}} -i %{{esrep/id}} -t %{{esrep/sleep_time}} %{{esrep/opt_callback}} %{{esrep/opt_limit}}' timeout_seconds='60'>
        </exec_method>

        <exec_method type='method' name='stop' exec=':kill' timeout_seconds='300'>
        </exec_method>

        <property_group name='startd' type='framework'>
             <propval name='duration' type='astring' value='child' />
        </property_group>

        <stability value='Evolving' />
    </service>
</service_bundle>
",
            path = xml_escape(&self.path),
            python_path = xml_escape(&self.python_path),
            bin = xml_escape(&self.sync_bin),
        );
        xml
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceManifest {
    pub master_uuid: String,
    pub slave_uuid: String,
    pub master_host: String,
    pub id: u32,
    pub sleep_time: f64,
    pub enabled: bool,
    /// Callback spec passed to `esrep sync -c`.
    pub callback: Option<String>,
    /// Bandwidth limit passed to `esrep sync -l`.
    pub limit: Option<String>,
}

impl InstanceManifest {
    pub fn render(&self) -> String {
        let opt_callback = self
            .callback
            .as_deref()
            .map(|c| format!("-c{c}"))
            .unwrap_or_default();
        let opt_limit = self
            .limit
            .as_deref()
            .map(|l| format!("-l{l}"))
            .unwrap_or_default();

        let mut xml = String::new();
        header(&mut xml);
        let _ = write!(
            xml,
            r"    <service name='{SERVICE_NAME}' type='service' version='0'>
        <instance name='{instance}' enabled='{enabled}'>
            <property_group name='esrep' type='application'>
                <propval name='master' type='astring' value='{master}' />
                <propval name='slave' type='astring' value='{slave}' />
                <propval name='master_host' type='astring' value='{master_host}' />
                <propval name='id' type='astring' value='{id}' />
                <propval name='sleep_time' type='astring' value='{sleep_time}' />
                <propval name='opt_callback' type='astring' value='{opt_callback}' />
                <propval name='opt_limit' type='astring' value='{opt_limit}' />
            </property_group>
        </instance>
    </service>
</service_bundle>
",
            instance = xml_escape(&instance_name(&self.slave_uuid)),
            enabled = self.enabled,
            master = xml_escape(&self.master_uuid),
            slave = xml_escape(&self.slave_uuid),
            master_host = xml_escape(&self.master_host),
            id = self.id,
            sleep_time = self.sleep_time,
            opt_callback = xml_escape(&opt_callback),
            opt_limit = xml_escape(&opt_limit),
        );
        xml
    }
}

fn header(xml: &mut String) {
    let _ = write!(
        xml,
        r#"<?xml version="1.0"?>
<!DOCTYPE service_bundle SYSTEM "/usr/share/lib/xml/dtd/service_bundle.dtd.1">
<service_bundle type='manifest' name='{SERVICE_BASE_NAME}'>
"#
    );
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmri_and_instance_name() {
        assert_eq!(instance_name("abc"), "slave-abc");
        assert_eq!(instance_fmri("abc"), "svc:/application/esrep-sync:slave-abc");
    }

    #[test]
    fn bundle_start_method_keeps_argument_order() {
        let xml = BundleManifest {
            erigones_home: "/opt/erigones".to_owned(),
            path: "/usr/bin:/bin".to_owned(),
            python_path: String::new(),
            sync_bin: "/opt/erigones/bin/eslib/esrep-sync.sh".to_owned(),
        }
        .render();
        assert!(xml.contains(
            "exec='/opt/erigones/bin/eslib/esrep-sync.sh sync -q -m %{esrep/master} -s %{esrep/slave} -H %{esrep/master_host} -i %{esrep/id} -t %{esrep/sleep_time} %{esrep/opt_callback} %{esrep/opt_limit}'"
        ));
        assert!(xml.contains("working_directory='/opt/erigones/var/run'"));
        assert!(xml.contains("<envvar name='VIRTUAL_ENV' value='/opt/erigones/envs' />"));
        assert!(xml.contains("svc:/application/erigonesd:fast"));
        assert!(xml.contains("exec=':kill' timeout_seconds='300'"));
        assert!(xml.starts_with("<?xml version=\"1.0\"?>"));
    }

    #[test]
    fn instance_carries_options() {
        let manifest = InstanceManifest {
            master_uuid: "m".to_owned(),
            slave_uuid: "s".to_owned(),
            master_host: "node01".to_owned(),
            id: 2,
            sleep_time: 60.0,
            enabled: true,
            callback: Some("/usr/bin/notify:esrep".to_owned()),
            limit: None,
        };
        let xml = manifest.render();
        assert!(xml.contains("<instance name='slave-s' enabled='true'>"));
        assert!(xml.contains("name='id' type='astring' value='2'"));
        assert!(xml.contains("name='sleep_time' type='astring' value='60'"));
        assert!(xml.contains("value='-c/usr/bin/notify:esrep'"));
        assert!(xml.contains("name='opt_limit' type='astring' value=''"));
    }

    #[test]
    fn values_are_escaped() {
        assert_eq!(xml_escape("a'b<c>&"), "a&apos;b&lt;c&gt;&amp;");
    }
}
