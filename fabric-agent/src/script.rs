//! Generates the one-shot job payload. The workload's own language is an
//! implementation detail (spec.md §4.2); Python is kept here only because
//! it is the simplest thing that can shell out to `nvme-cli` and print the
//! `SUCCESS:`/`FAILED:` contract without extra dependencies in the image.

pub fn connect(ip: &str, port: &str, sub_nqn: &str) -> String {
    format!(
        r#"
import json, subprocess, time

def devices():
    r = subprocess.run(['nvme', 'list', '-o', 'json'], stdout=subprocess.PIPE)
    return {{d['DevicePath'] for d in json.loads(r.stdout).get('Devices', [])}}

before = devices()
subprocess.run(['nvme', 'connect', '-t', 'tcp', '-n', '{sub_nqn}', '-a', '{ip}', '-s', '{port}'], check=True)
time.sleep(1)
new = devices() - before
if new:
    print('SUCCESS:', '\n'.join(new))
else:
    print('FAILED: No new devices connected.')
"#
    )
}

pub fn disconnect(sub_nqn: &str) -> String {
    format!(
        r#"
import subprocess

r = subprocess.run(['nvme', 'disconnect', '-n', '{sub_nqn}'], stdout=subprocess.PIPE)
output = r.stdout.decode().strip()
if 'disconnected 0 controller(s)' in output:
    print('FAILED:', output)
else:
    print('SUCCESS:', output)
"#
    )
}

pub fn list_connected(sub_nqns: &[String]) -> String {
    let joined = sub_nqns.join(",");
    format!(
        r#"
import json, subprocess

def check(subnqns):
    r = subprocess.run(['nvme', 'list', '-o', 'json'], stdout=subprocess.PIPE)
    devices = json.loads(r.stdout).get('Devices', [])
    for subnqn in subnqns:
        found = None
        for device in devices:
            path = device.get('DevicePath')
            if not path:
                continue
            idr = subprocess.run(['nvme', 'id-ctrl', path, '-o', 'json'], stdout=subprocess.PIPE)
            if json.loads(idr.stdout).get('subnqn') == subnqn:
                found = path
                break
        if found:
            print(f'SUCCESS: {{subnqn}}, {{found}}')
        else:
            print(f'FAILED: {{subnqn}} is not connected to any device')

check('{joined}'.split(','))
"#
    )
}
